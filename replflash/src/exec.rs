//! Command executor for the raw REPL.
//!
//! Code is written in bounded chunks with a fixed pause after each one, then
//! EOT asks the board to run it. The board acknowledges with `OK` and
//! afterwards emits the completion frame:
//!
//! ```text
//! OK <stdout> 0x04 <stderr> 0x04 >
//! ```
//!
//! [`Connection::execute`] only waits for the acknowledgement and leaves the
//! rest of the stream in the inbound queue. [`Connection::follow`] and
//! [`Connection::run_remote`] also consume the completion frame so the next
//! exchange starts from a clean queue.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::connection::Connection;
use crate::error::ExecError;
use crate::queue::WaitError;
use crate::repl::RawReplState;
use crate::repl::control::EOT;

/// Largest single write of command text.
pub const COMMAND_CHUNK_SIZE: usize = 256;

/// Acknowledgement the board sends once it accepted the code.
pub const SUCCESS_MARKER: &[u8] = b"OK";

/// Text that follows the `OK` a board sends when it soft-reboots in raw mode.
const SOFT_REBOOT_BANNER: &[u8] = b"\r\nMPY: soft reboot";

/// Default time allowed for the board to acknowledge and finish a command.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// Output captured from one raw REPL exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Bytes the code printed.
    pub stdout: Vec<u8>,
    /// Traceback text, empty on success.
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Whether the code finished without a traceback.
    pub fn is_success(&self) -> bool {
        self.stderr
            .is_empty()
    }

    /// Stdout decoded lossily.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

enum Ack {
    Accepted,
    Rejected(Vec<u8>),
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

/// Offset past soft-reboot banners left over from entering raw mode.
///
/// `None` while a banner is still arriving.
fn skip_reboot_banners(bytes: &[u8]) -> Option<usize> {
    let mut offset = 0;
    loop {
        let Some(marker) = find(&bytes[offset..], SUCCESS_MARKER) else {
            return Some(offset);
        };
        let tail = &bytes[offset + marker + SUCCESS_MARKER.len()..];
        let n = tail
            .len()
            .min(SOFT_REBOOT_BANNER.len());
        if n == 0 || tail[..n] != SOFT_REBOOT_BANNER[..n] {
            return Some(offset);
        }
        if tail.len() < SOFT_REBOOT_BANNER.len() {
            return None;
        }
        let prompt = tail
            .iter()
            .position(|&b| b == b'>')?;
        offset = bytes.len() - tail.len() + prompt + 1;
    }
}

/// An EOT before the marker means the board answered with something else.
fn check_ack(bytes: &[u8]) -> Option<Ack> {
    let bytes = &bytes[skip_reboot_banners(bytes)?..];
    let marker = find(bytes, SUCCESS_MARKER);
    let eot = bytes
        .iter()
        .position(|&b| b == EOT);
    match (marker, eot) {
        (Some(m), Some(e)) if e < m => Some(Ack::Rejected(bytes[..e].to_vec())),
        (Some(_), _) => Some(Ack::Accepted),
        (None, Some(e)) => Some(Ack::Rejected(bytes[..e].to_vec())),
        (None, None) => None,
    }
}

/// Splits the completion frame into its stdout and stderr sections.
#[derive(Default)]
struct CompletionFrame {
    output: ExecOutput,
    terminators: usize,
}

impl CompletionFrame {
    /// Consume `bytes`; returns `true` once both terminators were seen.
    fn feed(&mut self, bytes: &[u8], on_output: &mut dyn FnMut(&[u8])) -> bool {
        let mut rest = bytes;
        while !rest.is_empty() && self.terminators < 2 {
            let (body, next) = match rest
                .iter()
                .position(|&b| b == EOT)
            {
                Some(i) => (&rest[..i], Some(&rest[i + 1..])),
                None => (rest, None),
            };

            if self.terminators == 0 {
                if !body.is_empty() {
                    on_output(body);
                }
                self.output
                    .stdout
                    .extend_from_slice(body);
            } else {
                self.output
                    .stderr
                    .extend_from_slice(body);
            }

            match next {
                Some(next) => {
                    self.terminators += 1;
                    rest = next;
                },
                None => rest = &[],
            }
        }
        if self.terminators >= 2 && !rest.is_empty() {
            trace!("Ignoring {} bytes after completion frame", rest.len());
        }
        self.terminators >= 2
    }
}

impl Connection {
    /// Send `command` to the raw REPL and wait for the `OK` acknowledgement.
    ///
    /// Stale queue contents are discarded first. The acknowledgement and any
    /// output following it stay in the inbound queue.
    pub fn execute(&mut self, command: &[u8], timeout: Duration) -> Result<(), ExecError> {
        if self.state != RawReplState::RawActive {
            return Err(ExecError::NotRaw(self.state));
        }

        let stale = self
            .queue()
            .clear();
        if stale > 0 {
            debug!("Discarded {stale} stale bytes before execute");
        }
        self.state = RawReplState::Executing;
        let result = self.send_and_ack(command, timeout);
        self.state = if self.is_open() {
            RawReplState::RawActive
        } else {
            RawReplState::Friendly
        };
        result
    }

    fn send_and_ack(&mut self, command: &[u8], timeout: Duration) -> Result<(), ExecError> {
        debug!(
            "Executing {} bytes in {} chunks",
            command.len(),
            command
                .len()
                .div_ceil(COMMAND_CHUNK_SIZE)
        );
        for chunk in command.chunks(COMMAND_CHUNK_SIZE) {
            self.write(chunk)?;
            thread::sleep(self.timing.chunk_pacing);
        }
        self.write(&[EOT])?;

        let deadline = Instant::now() + timeout;
        match self
            .queue()
            .wait_until(deadline, check_ack)
        {
            Ok(Ack::Accepted) => {
                trace!("Command acknowledged");
                Ok(())
            },
            Ok(Ack::Rejected(payload)) => {
                warn!("Device rejected command ({} bytes of diagnostics)", payload.len());
                Err(ExecError::DeviceRejected(payload))
            },
            Err(WaitError::TimedOut) => Err(ExecError::Timeout(timeout)),
            Err(WaitError::Closed) => Err(ExecError::Cancelled),
        }
    }

    /// Execute `command` and consume its completion frame.
    ///
    /// Stdout is handed to `on_output` as it arrives and also returned.
    /// `timeout` bounds the whole exchange. A traceback does not fail this
    /// call; it is returned in [`ExecOutput::stderr`].
    pub fn follow<F>(
        &mut self,
        command: &[u8],
        timeout: Duration,
        mut on_output: F,
    ) -> Result<ExecOutput, ExecError>
    where
        F: FnMut(&[u8]),
    {
        let deadline = Instant::now() + timeout;
        self.execute(command, timeout)?;

        let received = self
            .queue()
            .drain();
        let base = skip_reboot_banners(&received).unwrap_or(0);
        let start = find(&received[base..], SUCCESS_MARKER)
            .map_or(base, |i| base + i + SUCCESS_MARKER.len());
        let mut pending = received[start..].to_vec();

        let mut frame = CompletionFrame::default();
        while !frame.feed(&pending, &mut on_output) {
            pending = match self
                .queue()
                .wait_drain(deadline)
            {
                Ok(bytes) => bytes,
                Err(WaitError::TimedOut) => return Err(ExecError::Timeout(timeout)),
                Err(WaitError::Closed) => {
                    if !self.is_open() {
                        self.state = RawReplState::Friendly;
                    }
                    return Err(ExecError::Cancelled);
                },
            };
        }
        Ok(frame.output)
    }

    /// Execute `command`, returning its stdout.
    ///
    /// A traceback on the device fails with [`ExecError::DeviceRejected`]
    /// carrying the stderr text.
    pub fn run_remote(&mut self, command: &[u8], timeout: Duration) -> Result<ExecOutput, ExecError> {
        let output = self.follow(command, timeout, |_| {})?;
        if !output.is_success() {
            return Err(ExecError::DeviceRejected(output.stderr));
        }
        Ok(output)
    }
}
