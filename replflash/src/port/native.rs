//! Native serial port implementation using the `serialport` crate.
//!
//! The port is opened 8N1 without flow control. On Unix `serialport` claims
//! the TTY exclusively, so a second open of the same board fails with
//! [`ConnectError::PortUnavailable`].

use {
    crate::{
        error::{ConnectError, IoError},
        port::{Port, SerialConfig},
    },
    log::{debug, trace},
    serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits},
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self, ConnectError> {
        debug!(
            "Opening {} at {} baud",
            config.port_name, config.baud_rate
        );
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()
            .map_err(|e| ConnectError::PortUnavailable {
                path: config
                    .port_name
                    .clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            port: Some(port),
            name: config
                .port_name
                .clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    fn inner(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>, IoError> {
        self.port
            .as_mut()
            .ok_or(IoError::Disconnected)
    }
}

fn serial_err(err: serialport::Error) -> IoError {
    IoError::Io(err.into())
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn bytes_to_read(&mut self) -> Result<usize, IoError> {
        let pending = self
            .inner()?
            .bytes_to_read()
            .map_err(serial_err)?;
        Ok(usize::try_from(pending).unwrap_or(usize::MAX))
    }

    fn clear_buffers(&mut self) -> Result<(), IoError> {
        self.inner()?
            .clear(ClearBuffer::All)
            .map_err(serial_err)
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>, IoError> {
        let port = self
            .port
            .as_ref()
            .ok_or(IoError::Disconnected)?
            .try_clone()
            .map_err(serial_err)?;
        trace!("Cloned handle for {}", self.name);

        Ok(Box::new(Self {
            port: Some(port),
            name: self
                .name
                .clone(),
            timeout: self.timeout,
            baud_rate: self.baud_rate,
        }))
    }

    fn close(&mut self) -> Result<(), IoError> {
        // Dropping the handle closes the descriptor; a second call is a no-op.
        if self
            .port
            .take()
            .is_some()
        {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}
