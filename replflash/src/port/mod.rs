//! Port abstraction for the serial transport.
//!
//! Everything above this module talks to the device through the [`Port`]
//! trait, so the protocol layers never touch the `serialport` crate directly.
//!
//! ```text
//! +------------------+   +------------------+
//! |  raw REPL / exec |   |  terminal reader |
//! +--------+---------+   +--------+---------+
//!          | write                | read_available
//!          v                      v
//! +--------+----------------------+---------+
//! |               Port trait                |
//! +--------+----------------------+---------+
//!          |                      |
//! +--------+---------+   +--------+---------+
//! | NativePort       |   | SimPort (tests)  |
//! |  (serialport)    |   |  in-memory board |
//! +------------------+   +------------------+
//! ```
//!
//! A connection uses two handles to the same device: the caller's thread
//! writes through one, the background reader polls the other. Implementations
//! provide the second handle through [`Port::try_clone_port`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use replflash::port::Port;
//!
//! fn example(port: &mut dyn Port) -> Result<(), replflash::error::IoError> {
//!     port.write_all_bytes(b"\r\x03\x03")?;
//!     let pending = port.read_available()?;
//!     println!("Received: {pending:?}");
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod sim;

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::IoError;

/// Fixed line rate used by the boards' REPL.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default read timeout for the underlying serial handle.
///
/// Reads are only issued for bytes already reported pending, so this only
/// bounds how long a read can stall on a misbehaving driver.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl SerialConfig {
    /// Create a configuration for the given device path at the default baud rate.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Unified port trait for serial communication.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Number of received bytes waiting to be read.
    ///
    /// Fails once the device is gone, which is how the background reader
    /// notices an unplugged board.
    fn bytes_to_read(&mut self) -> Result<usize, IoError>;

    /// Discard whatever the OS has buffered in either direction.
    fn clear_buffers(&mut self) -> Result<(), IoError>;

    /// Open a second handle to the same device for a reader thread.
    fn try_clone_port(&self) -> Result<Box<dyn Port>, IoError>;

    /// Close the port and release resources.
    ///
    /// Must be idempotent. After calling this method, the port cannot be used
    /// for further I/O.
    fn close(&mut self) -> Result<(), IoError>;

    /// Write all bytes, blocking until complete.
    ///
    /// This does not wait for any acknowledgement from the device.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<(), IoError> {
        Write::write_all(self, buf)?;
        Write::flush(self)?;
        Ok(())
    }

    /// Read whatever is pending without blocking.
    ///
    /// Returns an empty vector when nothing has arrived.
    fn read_available(&mut self) -> Result<Vec<u8>, IoError> {
        let pending = self.bytes_to_read()?;
        if pending == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; pending];
        match self.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            },
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Ok(Vec::new())
            },
            Err(e) => Err(IoError::Io(e)),
        }
    }
}

#[cfg(feature = "native")]
pub use native::NativePort;
