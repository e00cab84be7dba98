//! In-memory port for tests.
//!
//! [`SimPort`] implements [`Port`] over shared buffers: every `write` call is
//! recorded and handed to a [`SimDevice`], whose reply becomes readable
//! input. [`SimBoard`] emulates the parts of a MicroPython raw REPL the
//! protocol layers rely on, with an in-memory filesystem.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::ConnectOptions;
use crate::error::IoError;
use crate::port::{DEFAULT_BAUD, Port};
use crate::repl::ReplTiming;

/// Connection options with millisecond-scale delays for tests.
pub(crate) fn fast_options() -> ConnectOptions {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
    ConnectOptions::new("sim")
        .with_poll_interval(Duration::from_millis(1))
        .with_timing(ReplTiming::fast())
}

/// Device side of a simulated port.
pub(crate) trait SimDevice: Send {
    /// React to bytes written by the host; the return value is sent back.
    fn on_write(&mut self, bytes: &[u8]) -> Vec<u8>;
}

impl<F> SimDevice for F
where
    F: FnMut(&[u8]) -> Vec<u8> + Send,
{
    fn on_write(&mut self, bytes: &[u8]) -> Vec<u8> {
        self(bytes)
    }
}

struct Wire {
    inbound: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    device: Box<dyn SimDevice>,
    unplugged: bool,
}

/// Simulated serial port. Clones share the same wire.
#[derive(Clone)]
pub(crate) struct SimPort {
    wire: Arc<Mutex<Wire>>,
    open: bool,
    timeout: Duration,
}

impl SimPort {
    pub(crate) fn new(device: impl SimDevice + 'static) -> Self {
        Self {
            wire: Arc::new(Mutex::new(Wire {
                inbound: VecDeque::new(),
                writes: Vec::new(),
                device: Box::new(device),
                unplugged: false,
            })),
            open: true,
            timeout: Duration::from_millis(50),
        }
    }

    /// A device that never answers.
    pub(crate) fn silent() -> Self {
        Self::new(|_: &[u8]| Vec::new())
    }

    /// A device that answers `OK` to every EOT byte.
    pub(crate) fn echo_ok() -> Self {
        Self::new(|bytes: &[u8]| {
            bytes
                .iter()
                .filter(|b| **b == 0x04)
                .flat_map(|_| b"OK".iter().copied())
                .collect()
        })
    }

    /// Push bytes as if the device had sent them unprompted.
    pub(crate) fn emit(&self, bytes: &[u8]) {
        self.wire
            .lock()
            .unwrap()
            .inbound
            .extend(bytes.iter().copied());
    }

    /// Simulate the cable being pulled.
    pub(crate) fn unplug(&self) {
        self.wire
            .lock()
            .unwrap()
            .unplugged = true;
    }

    /// Every `write` call made so far, in order.
    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.wire
            .lock()
            .unwrap()
            .writes
            .clone()
    }

    /// All written bytes concatenated.
    pub(crate) fn written(&self) -> Vec<u8> {
        self.writes()
            .concat()
    }

    pub(crate) fn clear_writes(&self) {
        self.wire
            .lock()
            .unwrap()
            .writes
            .clear();
    }

    fn check_open(&self) -> io::Result<()> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        if self
            .wire
            .lock()
            .unwrap()
            .unplugged
        {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        Ok(())
    }
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        let mut wire = self
            .wire
            .lock()
            .unwrap();
        if wire.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(wire.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(wire.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        let mut wire = self
            .wire
            .lock()
            .unwrap();
        wire.writes
            .push(buf.to_vec());
        let reply = wire
            .device
            .on_write(buf);
        wire.inbound
            .extend(reply);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()
    }
}

impl Port for SimPort {
    fn name(&self) -> &str {
        "sim"
    }

    fn baud_rate(&self) -> u32 {
        DEFAULT_BAUD
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn bytes_to_read(&mut self) -> Result<usize, IoError> {
        self.check_open()?;
        Ok(self
            .wire
            .lock()
            .unwrap()
            .inbound
            .len())
    }

    fn clear_buffers(&mut self) -> Result<(), IoError> {
        self.wire
            .lock()
            .unwrap()
            .inbound
            .clear();
        Ok(())
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>, IoError> {
        Ok(Box::new(self.clone()))
    }

    fn close(&mut self) -> Result<(), IoError> {
        self.open = false;
        Ok(())
    }
}

/// Observable state of a [`SimBoard`].
#[derive(Debug, Default)]
pub(crate) struct BoardState {
    pub(crate) files: HashMap<String, Vec<u8>>,
    pub(crate) raw: bool,
    pub(crate) executed: Vec<String>,
    pub(crate) write_statements: usize,
}

/// Raw-REPL board emulation with an in-memory filesystem.
pub(crate) struct SimBoard {
    state: Arc<Mutex<BoardState>>,
    code: Vec<u8>,
    open_file: Option<String>,
}

impl SimBoard {
    pub(crate) fn new() -> (Self, Arc<Mutex<BoardState>>) {
        let state = Arc::new(Mutex::new(BoardState::default()));
        (
            Self {
                state: state.clone(),
                code: Vec::new(),
                open_file: None,
            },
            state,
        )
    }

    /// Run one submitted code block, returning (stdout, stderr).
    fn run(&mut self, code: &str) -> (Vec<u8>, Vec<u8>) {
        let mut state = self
            .state
            .lock()
            .unwrap();
        state
            .executed
            .push(code.to_string());
        let code = code.trim();

        if code.contains("hexlify(") {
            let name = after(code, "open(").and_then(parse_literal);
            return match name.and_then(|(n, _)| state.files.get(&lossy(&n)).cloned()) {
                Some(data) => (hex(&data).into_bytes(), Vec::new()),
                None => (Vec::new(), traceback("OSError: [Errno 2] ENOENT")),
            };
        }
        if let Some(rest) = code.strip_prefix("f = open(") {
            let Some((name, _)) = parse_literal(rest) else {
                return (Vec::new(), traceback("SyntaxError: invalid syntax"));
            };
            let name = lossy(&name);
            state
                .files
                .insert(name.clone(), Vec::new());
            self.open_file = Some(name);
            return (Vec::new(), Vec::new());
        }
        if let Some(rest) = code.strip_prefix("f.write(b") {
            let Some((data, _)) = parse_literal(rest) else {
                return (Vec::new(), traceback("SyntaxError: invalid syntax"));
            };
            state.write_statements += 1;
            return match self.open_file.as_ref() {
                Some(name) => {
                    state
                        .files
                        .entry(name.clone())
                        .or_default()
                        .extend_from_slice(&data);
                    (Vec::new(), Vec::new())
                },
                None => (Vec::new(), traceback("NameError: name 'f' isn't defined")),
            };
        }
        if code == "f.close()" {
            self.open_file = None;
            return (Vec::new(), Vec::new());
        }
        if let Some(inner) = code
            .strip_prefix("print(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let text = inner.trim_matches(|c| c == '\'' || c == '"');
            return (format!("{text}\r\n").into_bytes(), Vec::new());
        }
        if code.starts_with("raise") {
            return (Vec::new(), traceback("Exception:"));
        }
        (Vec::new(), Vec::new())
    }
}

impl SimDevice for SimBoard {
    fn on_write(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &byte in bytes {
            let raw = self
                .state
                .lock()
                .unwrap()
                .raw;
            match (raw, byte) {
                (_, 0x01) => {
                    self.state.lock().unwrap().raw = true;
                    self.code.clear();
                    out.extend_from_slice(b"raw REPL; CTRL-B to exit\r\n>");
                },
                (_, 0x02) => {
                    self.state.lock().unwrap().raw = false;
                    self.code.clear();
                    out.extend_from_slice(b"\r\nMicroPython v1.23.0 on sim\r\n>>> ");
                },
                (_, 0x03) => {
                    self.code.clear();
                    if !raw {
                        out.extend_from_slice(b"\r\n>>> ");
                    }
                },
                (true, 0x04) if self.code.is_empty() => {
                    out.extend_from_slice(b"OK\r\nMPY: soft reboot\r\nraw REPL; CTRL-B to exit\r\n>");
                },
                (true, 0x04) => {
                    let code = String::from_utf8_lossy(&std::mem::take(&mut self.code)).into_owned();
                    let (stdout, stderr) = self.run(&code);
                    out.extend_from_slice(b"OK");
                    out.extend_from_slice(&stdout);
                    out.push(0x04);
                    out.extend_from_slice(&stderr);
                    out.push(0x04);
                    out.push(b'>');
                },
                (false, 0x04) => out.extend_from_slice(b"MPY: soft reboot\r\n>>> "),
                (true, b) => self.code.push(b),
                (false, b'\r') => out.extend_from_slice(b"\r\n>>> "),
                (false, b) => out.push(b),
            }
        }
        out
    }
}

fn traceback(last_line: &str) -> Vec<u8> {
    format!("Traceback (most recent call last):\r\n  File \"<stdin>\", line 1\r\n{last_line}\r\n")
        .into_bytes()
}

fn after<'a>(haystack: &'a str, needle: &str) -> Option<&'a str> {
    haystack
        .find(needle)
        .map(|i| &haystack[i + needle.len()..])
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn hex(data: &[u8]) -> String {
    use std::fmt::Write as _;
    data.iter()
        .fold(String::with_capacity(data.len() * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}

/// Parse a single-quoted Python literal at the start of `s`.
fn parse_literal(s: &str) -> Option<(Vec<u8>, &str)> {
    let body = s.strip_prefix('\'')?;
    let mut out = Vec::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\'' => return Some((out, &body[i + 1..])),
            '\\' => match chars.next()?.1 {
                'x' => {
                    let hi = chars.next()?.1.to_digit(16)?;
                    let lo = chars.next()?.1.to_digit(16)?;
                    out.push(u8::try_from(hi * 16 + lo).ok()?);
                },
                'n' => out.push(b'\n'),
                'r' => out.push(b'\r'),
                't' => out.push(b'\t'),
                other => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                },
            },
            other => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            },
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal_escapes() {
        let (bytes, rest) = parse_literal(r"'a\x00\\\'b')").unwrap();
        assert_eq!(bytes, b"a\x00\\'b");
        assert_eq!(rest, ")");
    }

    #[test]
    fn test_board_executes_print() {
        let (mut board, _) = SimBoard::new();
        board.on_write(b"\x01");
        let out = board.on_write(b"print(1)\x04");
        assert_eq!(out, b"OK1\r\n\x04\x04>");
    }
}
