//! Raw REPL session state machine.
//!
//! MicroPython boards expose two REPL modes over the serial line: the
//! interactive ("friendly") prompt and the raw REPL used for scripted code
//! delivery. This module negotiates between them.
//!
//! ## Transitions
//!
//! ```text
//! Friendly --enter()--> EnteringRaw --> RawActive --execute()--> Executing
//!    ^                                   |  ^                       |
//!    +------------- exit() --------------+  +------- ack ----------+
//! ```
//!
//! Entering raw mode interrupts twice, requests raw mode, soft-resets and
//! interrupts again, because the board may be running a persistent program.
//! Every step is idempotent on the device side. The pauses in between are
//! fixed settle times of the board's reset path and are not polled.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::connection::Connection;
use crate::error::ExecError;

/// REPL control characters.
pub mod control {
    /// Start of Header: enter raw REPL (Ctrl-A).
    pub const SOH: u8 = 0x01;
    /// Start of Text: exit raw REPL (Ctrl-B).
    pub const STX: u8 = 0x02;
    /// End of Text: keyboard interrupt (Ctrl-C).
    pub const ETX: u8 = 0x03;
    /// End of Transmission: soft reset / run buffered code (Ctrl-D).
    pub const EOT: u8 = 0x04;

    /// Interrupt any running program.
    pub const INTERRUPT: &[u8] = b"\r\x03\x03";
    /// Request raw mode.
    pub const ENTER_RAW: &[u8] = b"\r\x01";
    /// Soft reset (empty buffer) or run (non-empty buffer).
    pub const SOFT_RESET: &[u8] = &[EOT];
    /// Second interrupt after the soft reset, in case `main.py` started.
    pub const GUARD_INTERRUPT: &[u8] = &[ETX, ETX];
    /// Return to the friendly REPL.
    pub const EXIT_RAW: &[u8] = b"\r\x02";
}

/// Pause after requesting raw mode.
pub const RAW_REQUEST_SETTLE: Duration = Duration::from_millis(100);

/// Pause after the soft reset.
pub const SOFT_RESET_SETTLE: Duration = Duration::from_millis(500);

/// Pause after each command chunk so the board's input buffer is not flooded.
pub const CHUNK_PACING: Duration = Duration::from_millis(10);

/// Raw REPL negotiation state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RawReplState {
    /// Interactive prompt; bytes belong to the terminal.
    #[default]
    Friendly,
    /// Raw mode requested, settle delays in progress.
    EnteringRaw,
    /// Raw mode ready for code.
    RawActive,
    /// Code sent, waiting for the acknowledgement.
    Executing,
    /// Returning to the friendly prompt.
    ExitingRaw,
}

impl RawReplState {
    /// Whether the protocol (not the terminal) owns the byte stream.
    pub fn is_raw(self) -> bool {
        self != Self::Friendly
    }
}

impl fmt::Display for RawReplState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Friendly => "friendly",
            Self::EnteringRaw => "entering-raw",
            Self::RawActive => "raw",
            Self::Executing => "executing",
            Self::ExitingRaw => "exiting-raw",
        };
        f.write_str(name)
    }
}

/// Fixed delays used while talking to the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplTiming {
    /// Pause after `\r\x01`.
    pub raw_request_settle: Duration,
    /// Pause after the soft reset.
    pub soft_reset_settle: Duration,
    /// Pause after each command chunk.
    pub chunk_pacing: Duration,
}

impl Default for ReplTiming {
    fn default() -> Self {
        Self {
            raw_request_settle: RAW_REQUEST_SETTLE,
            soft_reset_settle: SOFT_RESET_SETTLE,
            chunk_pacing: CHUNK_PACING,
        }
    }
}

impl ReplTiming {
    #[cfg(test)]
    pub(crate) fn fast() -> Self {
        Self {
            raw_request_settle: Duration::from_millis(2),
            soft_reset_settle: Duration::from_millis(20),
            chunk_pacing: Duration::from_millis(1),
        }
    }
}

impl Connection {
    /// Switch the board into the raw REPL.
    ///
    /// Detaches the terminal subscriber first. Calling this while already in
    /// raw mode leaves the state and the inbound queue untouched.
    pub fn enter_raw_repl(&mut self) -> Result<(), ExecError> {
        match self.state {
            RawReplState::RawActive => {
                debug!("Raw REPL already active");
                return Ok(());
            },
            RawReplState::Friendly => {},
            other => debug!("Entering raw REPL from {other}"),
        }

        self.detach_terminal();
        let result = self.negotiate_raw();
        if result.is_err() {
            self.state = RawReplState::Friendly;
            self.attach_terminal();
        }
        result
    }

    fn negotiate_raw(&mut self) -> Result<(), ExecError> {
        self.write(control::INTERRUPT)?;
        let stale = self
            .queue()
            .clear();
        debug!("Interrupted board, discarded {stale} stale bytes");
        self.state = RawReplState::EnteringRaw;

        self.write(control::ENTER_RAW)?;
        thread::sleep(self.timing.raw_request_settle);

        self.write(control::SOFT_RESET)?;
        thread::sleep(self.timing.soft_reset_settle);
        self.write(control::GUARD_INTERRUPT)?;

        self.state = RawReplState::RawActive;
        info!("Raw REPL active on {}", self.path());
        Ok(())
    }

    /// Return the board to the friendly REPL and reattach the terminal.
    ///
    /// The state ends up `Friendly` even if the write fails.
    pub fn exit_raw_repl(&mut self) -> Result<(), ExecError> {
        if self.state == RawReplState::Friendly {
            return Ok(());
        }

        self.state = RawReplState::ExitingRaw;
        let result = self
            .write(control::EXIT_RAW)
            .map_err(ExecError::from);
        self.state = RawReplState::Friendly;
        self.attach_terminal();
        debug!("Back to friendly REPL");
        result
    }

    /// Interrupt whatever the board is running (Ctrl-C twice).
    pub fn interrupt(&self) -> Result<(), ExecError> {
        self.write(control::INTERRUPT)?;
        Ok(())
    }

    /// Leave raw mode, interrupt, then soft-reset the board.
    ///
    /// Exit-raw goes out even when the host already believes the board is
    /// friendly.
    pub fn soft_reset(&mut self) -> Result<(), ExecError> {
        if self.state == RawReplState::Friendly {
            self.write(control::EXIT_RAW)?;
        } else {
            self.exit_raw_repl()?;
        }
        self.interrupt()?;
        self.write(control::SOFT_RESET)?;
        info!("Soft reset sent to {}", self.path());
        Ok(())
    }
}
