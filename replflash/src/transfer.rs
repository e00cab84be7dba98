//! File transfer over the raw REPL.
//!
//! There is no binary channel to the board's filesystem, so both directions
//! are done by generating small Python snippets:
//!
//! - **push** opens the remote file for writing, runs one `f.write(b'...')`
//!   statement per chunk with the chunk spelled out as an escaped bytes
//!   literal, then closes the file.
//! - **pull** runs a script that reads the file in chunks and prints each one
//!   hex-encoded, so the EOT that ends the raw REPL output can never be
//!   confused with file content.
//!
//! Every statement is run as a full exchange ([`Connection::run_remote`]),
//! so no response bytes are left behind for the next statement.

use std::fmt::Write as _;
use std::time::Duration;

use log::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{ExecError, TransferError};

/// Bytes per remote write statement and per remote read.
pub const DEFAULT_CHUNK_SIZE: usize = 32;

/// Overall time allowed for reading a file back.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for each open/write/close statement of a push.
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// File transfer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferConfig {
    /// Bytes per generated literal (and per remote read).
    pub chunk_size: usize,
    /// Overall timeout of a pull.
    pub timeout: Duration,
    /// Timeout of each statement of a push.
    pub statement_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout: DEFAULT_TRANSFER_TIMEOUT,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
        }
    }
}

impl TransferConfig {
    /// Set the chunk size. Zero is treated as one.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Set the overall pull timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Escape `data` as a Python bytes literal (`b'...'`).
pub fn bytes_literal(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4 + 3);
    out.push_str("b'");
    for &byte in data {
        push_escaped(&mut out, byte);
    }
    out.push('\'');
    out
}

/// Escape `text` as a single-quoted Python string literal.
///
/// Non-ASCII characters are passed through; MicroPython source is UTF-8.
pub fn str_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match u8::try_from(c) {
            Ok(byte) if byte.is_ascii() => push_escaped(&mut out, byte),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn push_escaped(out: &mut String, byte: u8) {
    match byte {
        b'\\' => out.push_str("\\\\"),
        b'\'' => out.push_str("\\'"),
        0x20..=0x7E => out.push(char::from(byte)),
        _ => {
            let _ = write!(out, "\\x{byte:02x}");
        },
    }
}

/// Remote script that prints `filename` hex-encoded, `chunk_size` bytes at a time.
fn pull_script(filename: &str, chunk_size: usize) -> String {
    format!(
        "import ubinascii\n\
         with open({name}, 'rb') as f:\n\
         \x20   while True:\n\
         \x20       b = f.read({chunk_size})\n\
         \x20       if not b:\n\
         \x20           break\n\
         \x20       print(ubinascii.hexlify(b).decode(), end='')\n",
        name = str_literal(filename),
    )
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn decode_hex(text: &[u8]) -> Result<Vec<u8>, TransferError> {
    let text = text.trim_ascii();
    if text.len() % 2 != 0 {
        return Err(TransferError::InvalidPayload(format!(
            "odd hex length {}",
            text.len()
        )));
    }
    text.chunks(2)
        .map(|pair| {
            nibble(pair[0])
                .zip(nibble(pair[1]))
                .map(|(hi, lo)| (hi << 4) | lo)
                .ok_or_else(|| {
                    TransferError::InvalidPayload(format!(
                        "not hex: {:?}",
                        String::from_utf8_lossy(pair)
                    ))
                })
        })
        .collect()
}

/// Pushes and pulls files through an open connection.
pub struct FileTransfer<'a> {
    conn: &'a mut Connection,
    config: TransferConfig,
}

impl<'a> FileTransfer<'a> {
    /// Use the default settings.
    pub fn new(conn: &'a mut Connection) -> Self {
        Self::with_config(conn, TransferConfig::default())
    }

    /// Use explicit settings.
    pub fn with_config(conn: &'a mut Connection, config: TransferConfig) -> Self {
        Self { conn, config }
    }

    /// Current settings.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Write `data` to `filename` on the board.
    ///
    /// Success only means every statement was accepted; use
    /// [`verify`](Self::verify) to check what actually landed on the board.
    pub fn push(&mut self, filename: &str, data: &[u8]) -> Result<(), TransferError> {
        self.push_with_progress(filename, data, |_, _| {})
    }

    /// Like [`push`](Self::push), reporting `(bytes_sent, total)` after each chunk.
    pub fn push_with_progress<F>(
        &mut self,
        filename: &str,
        data: &[u8],
        mut progress: F,
    ) -> Result<(), TransferError>
    where
        F: FnMut(usize, usize),
    {
        info!("Pushing {} bytes to {filename}", data.len());
        self.conn
            .enter_raw_repl()?;
        let result = self.write_remote(filename, data, &mut progress);
        self.finish(result)
    }

    fn write_remote(
        &mut self,
        filename: &str,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<(), TransferError> {
        let timeout = self
            .config
            .statement_timeout;
        let open = format!("f = open({}, 'wb')", str_literal(filename));
        self.conn
            .run_remote(open.as_bytes(), timeout)?;

        let total = data.len();
        let mut sent = 0;
        for chunk in data.chunks(self.config.chunk_size.max(1)) {
            let statement = format!("f.write({})", bytes_literal(chunk));
            self.conn
                .run_remote(statement.as_bytes(), timeout)?;
            sent += chunk.len();
            progress(sent, total);
        }

        self.conn
            .run_remote(b"f.close()", timeout)?;
        debug!("Wrote {sent} bytes to {filename}");
        Ok(())
    }

    /// Read `filename` from the board.
    pub fn pull(&mut self, filename: &str) -> Result<Vec<u8>, TransferError> {
        info!("Pulling {filename}");
        self.conn
            .enter_raw_repl()?;
        self.conn
            .queue()
            .clear();
        let result = self.read_remote(filename);
        self.finish(result)
    }

    fn read_remote(&mut self, filename: &str) -> Result<Vec<u8>, TransferError> {
        let script = pull_script(filename, self.config.chunk_size.max(1));
        let mut hex_digits = 0usize;
        let output = match self
            .conn
            .follow(script.as_bytes(), self.config.timeout, |chunk| {
                hex_digits += chunk
                    .iter()
                    .filter(|b| b.is_ascii_hexdigit())
                    .count();
            }) {
            Ok(output) => output,
            Err(ExecError::Timeout(_)) => {
                return Err(TransferError::IncompleteRead {
                    received: hex_digits / 2,
                });
            },
            Err(e) => return Err(e.into()),
        };

        if !output.is_success() {
            return Err(ExecError::DeviceRejected(output.stderr).into());
        }
        let data = decode_hex(&output.stdout)?;
        debug!("Read {} bytes from {filename}", data.len());
        Ok(data)
    }

    /// Pull `filename` and compare it byte for byte with `expected`.
    pub fn verify(&mut self, filename: &str, expected: &[u8]) -> Result<bool, TransferError> {
        let actual = self.pull(filename)?;
        let matches = actual == expected;
        if !matches {
            warn!(
                "{filename} differs: expected {} bytes, read back {}",
                expected.len(),
                actual.len()
            );
        }
        Ok(matches)
    }

    /// Leave raw mode; the operation's own error wins over an exit failure.
    fn finish<T>(&mut self, result: Result<T, TransferError>) -> Result<T, TransferError> {
        let exit = self
            .conn
            .exit_raw_repl();
        match result {
            Ok(value) => {
                exit?;
                Ok(value)
            },
            Err(e) => {
                if let Err(exit_err) = exit {
                    debug!("Leaving raw REPL after failed transfer: {exit_err}");
                }
                Err(e)
            },
        }
    }
}
