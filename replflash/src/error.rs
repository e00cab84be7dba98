//! Error types for replflash.
//!
//! Errors are grouped the same way the layers are: opening a port, moving
//! bytes, executing code in the raw REPL and transferring files. The
//! crate-wide [`Error`] wraps all of them for callers that don't care which
//! layer failed.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::repl::RawReplState;

/// Result type for replflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to open a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The device path could not be claimed exclusively.
    #[error("Port unavailable: {path}: {reason}")]
    PortUnavailable {
        /// Device path that was requested.
        path: String,
        /// Reason reported by the operating system.
        reason: String,
    },
}

/// Transport-level I/O failure.
#[derive(Debug, Error)]
pub enum IoError {
    /// The connection is closed or the device went away.
    #[error("Device disconnected")]
    Disconnected,

    /// Underlying serial I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure while executing code in the raw REPL.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The success marker was not observed in time.
    #[error("Timeout after {} ms waiting for the device", .0.as_millis())]
    Timeout(Duration),

    /// The device answered with an error payload instead of the success marker.
    #[error("Device rejected command: {}", String::from_utf8_lossy(.0).trim())]
    DeviceRejected(Vec<u8>),

    /// The connection was closed (or the operation interrupted) while waiting.
    #[error("Operation cancelled")]
    Cancelled,

    /// Execution requires the raw REPL to be active.
    #[error("Raw REPL is not active (state: {0})")]
    NotRaw(RawReplState),

    /// Non-disconnect transport error.
    #[error(transparent)]
    Io(IoError),
}

impl From<IoError> for ExecError {
    fn from(err: IoError) -> Self {
        match err {
            IoError::Disconnected => Self::Cancelled,
            other => Self::Io(other),
        }
    }
}

/// Failure while pushing or pulling a file.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The end-of-transfer marker was not seen before the overall timeout.
    #[error("Incomplete read: {received} bytes received before timeout")]
    IncompleteRead {
        /// File bytes received before giving up.
        received: usize,
    },

    /// The file read back from the device differs from what was pushed.
    #[error("Verification failed for {filename}: expected {expected} bytes, read back {actual}")]
    VerifyMismatch {
        /// Remote file name.
        filename: String,
        /// Length of the data that was pushed.
        expected: usize,
        /// Length of the data that was read back.
        actual: usize,
    },

    /// The device returned data that is not valid transfer output.
    #[error("Invalid transfer payload: {0}")]
    InvalidPayload(String),

    /// The connection was closed while the transfer was in flight.
    #[error("Transfer cancelled")]
    Cancelled,

    /// A remote statement failed.
    #[error(transparent)]
    Exec(ExecError),
}

impl From<ExecError> for TransferError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Cancelled => Self::Cancelled,
            other => Self::Exec(other),
        }
    }
}

impl From<IoError> for TransferError {
    fn from(err: IoError) -> Self {
        ExecError::from(err).into()
    }
}

/// Error type for replflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection could not be established.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Transport I/O failed.
    #[error(transparent)]
    Io(#[from] IoError),

    /// Raw REPL execution failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// File transfer failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
