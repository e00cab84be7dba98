//! # replflash
//!
//! Talk to MicroPython boards over their serial REPL.
//!
//! This crate provides the device communication layer of a MicroPython IDE:
//!
//! - Serial transport with a background reader and a shared inbound queue
//! - Raw REPL negotiation (interrupt, raw mode, soft reset)
//! - Chunked code execution with `OK` acknowledgement and timeouts
//! - File upload/download by generating Python snippets on the fly
//! - A small VT100 interpreter for the friendly REPL's output
//!
//! ## Supported Boards
//!
//! - ESP8266 and ESP32 running MicroPython
//! - BBC micro:bit
//!
//! ## Features
//!
//! - `native` (default): Serial port support via the `serialport` crate
//! - `serde`: Serialization support for configuration and state types
//!
//! ## Example
//!
//! ```rust,no_run
//! use replflash::{Board, BoardKind};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut board = Board::connect("/dev/ttyUSB0", BoardKind::Esp8266)?;
//!
//!     // Show friendly-mode output as it arrives
//!     board.subscribe_terminal(Box::new(|chunk| {
//!         print!("{}", String::from_utf8_lossy(chunk));
//!     }));
//!
//!     // Run a snippet, then upload a script and check it landed intact
//!     board.run(b"import machine\nprint(machine.freq())")?;
//!     board.push_file("main.py", b"print('hello from main')\n")?;
//!
//!     board.reset()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod board;
pub mod connection;
pub mod error;
pub mod exec;
pub mod port;
pub mod queue;
pub mod reader;
pub mod repl;
pub mod terminal;
pub mod transfer;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by blocking waits.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Waits that see
/// it fail with a `Cancelled` error.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    board::{Board, BoardKind},
    connection::{CloseHandle, ConnectOptions, Connection, InterruptHandle},
    error::{ConnectError, Error, ExecError, IoError, Result, TransferError},
    exec::ExecOutput,
    port::{Port, SerialConfig},
    queue::InboundQueue,
    repl::{RawReplState, ReplTiming},
    terminal::{Terminal, TerminalCursor},
    transfer::{FileTransfer, TransferConfig},
};
