//! Owned connection to one board.
//!
//! A [`Connection`] bundles the write half of the transport, the background
//! reader that owns the read half, the shared [`InboundQueue`] and the raw
//! REPL state. It is passed explicitly to every protocol operation; nothing
//! is kept in globals.
//!
//! ```text
//!   caller thread                      reader thread
//!   -------------                      -------------
//!   Connection::write ---> Port        Port ---> read_available
//!                                                   |
//!                                      InboundQueue <+-> terminal subscriber
//!   execute / pull  <--- wait_until ---'            (friendly mode only)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, trace};

use crate::error::{ConnectError, IoError};
use crate::port::{Port, SerialConfig};
use crate::queue::{DEFAULT_QUEUE_LIMIT, InboundQueue};
use crate::reader::{BackgroundReader, ByteSink, HealthCallback, MAX_POLL_INTERVAL, ReaderContext, Subscriber};
use crate::repl::control::INTERRUPT;
use crate::repl::{RawReplState, ReplTiming};

/// Options used when opening a connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Serial port settings (path, baud rate, read timeout).
    pub serial: SerialConfig,
    /// How long the reader sleeps when nothing is pending.
    pub poll_interval: Duration,
    /// Fixed settle delays used by the raw REPL session.
    pub timing: ReplTiming,
    /// Inbound queue size limit in bytes.
    pub queue_limit: usize,
}

impl ConnectOptions {
    /// Default options for the given device path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            serial: SerialConfig::new(path),
            poll_interval: MAX_POLL_INTERVAL,
            timing: ReplTiming::default(),
            queue_limit: DEFAULT_QUEUE_LIMIT,
        }
    }

    /// Set the reader poll interval (clamped to 10 ms by the reader).
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the raw REPL settle delays.
    #[must_use]
    pub fn with_timing(mut self, timing: ReplTiming) -> Self {
        self.timing = timing;
        self
    }
}

struct Shared {
    writer: Mutex<Option<Box<dyn Port>>>,
    reader: Mutex<Option<BackgroundReader>>,
    queue: InboundQueue,
    subscriber: Arc<Subscriber>,
    health: Arc<Mutex<Option<HealthCallback>>>,
    connected: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn write(&self, bytes: &[u8]) -> Result<(), IoError> {
        if !self
            .connected
            .load(Ordering::Acquire)
        {
            return Err(IoError::Disconnected);
        }
        let mut writer = lock(&self.writer);
        let port = writer
            .as_mut()
            .ok_or(IoError::Disconnected)?;
        trace!("Writing {} bytes: {:02X?}", bytes.len(), bytes);
        port.write_all_bytes(bytes)
    }

    fn close(&self) {
        let was_connected = self
            .connected
            .swap(false, Ordering::AcqRel);
        self.queue
            .close();
        self.subscriber
            .set_attached(false);

        if let Some(mut reader) = lock(&self.reader).take() {
            reader.stop();
        }
        if let Some(mut port) = lock(&self.writer).take() {
            if let Err(e) = port.close() {
                debug!("Closing port failed: {e}");
            }
            info!("Disconnected from {}", port.name());
        } else if was_connected {
            debug!("Connection already released");
        }
    }
}

/// Closes a connection from any thread.
///
/// Operations blocked on the connection observe the closure and fail with a
/// `Cancelled` error instead of waiting for their timeout.
#[derive(Clone)]
pub struct CloseHandle {
    shared: Arc<Shared>,
}

impl CloseHandle {
    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.shared
            .close();
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        self.shared
            .connected
            .load(Ordering::Acquire)
    }
}

/// Sends the interrupt sequence from any thread.
///
/// Lets a caller stop a running program while another thread is blocked in
/// an exchange on the same connection.
#[derive(Clone)]
pub struct InterruptHandle {
    shared: Arc<Shared>,
}

impl InterruptHandle {
    /// Write `\r\x03\x03` to the device.
    pub fn interrupt(&self) -> Result<(), IoError> {
        self.shared
            .write(INTERRUPT)
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle")
            .field("open", &self.is_open())
            .finish()
    }
}

/// One open transport plus its protocol state.
pub struct Connection {
    path: String,
    baud_rate: u32,
    read_timeout: Duration,
    shared: Arc<Shared>,
    pub(crate) state: RawReplState,
    pub(crate) timing: ReplTiming,
}

impl Connection {
    /// Open the serial device described by `options`.
    #[cfg(feature = "native")]
    pub fn open(options: &ConnectOptions) -> Result<Self, ConnectError> {
        let port = crate::port::NativePort::open(&options.serial)?;
        Self::from_port(Box::new(port), options)
    }

    /// Wrap an already opened port and start the background reader.
    pub fn from_port(mut port: Box<dyn Port>, options: &ConnectOptions) -> Result<Self, ConnectError> {
        let path = port
            .name()
            .to_string();
        // Stale boot chatter must not reach the queue.
        if let Err(e) = port.clear_buffers() {
            debug!("Could not clear buffers on {path}: {e}");
        }
        let unavailable = |e: IoError| ConnectError::PortUnavailable {
            path: path.clone(),
            reason: e.to_string(),
        };

        let reader_port = port
            .try_clone_port()
            .map_err(unavailable)?;
        let shared = Arc::new(Shared {
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            queue: InboundQueue::with_limit(options.queue_limit),
            subscriber: Arc::new(Subscriber::default()),
            health: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(true)),
        });

        let ctx = ReaderContext {
            queue: shared
                .queue
                .clone(),
            subscriber: shared
                .subscriber
                .clone(),
            health: shared
                .health
                .clone(),
            connected: shared
                .connected
                .clone(),
        };
        let reader = BackgroundReader::spawn(reader_port, ctx, options.poll_interval)
            .map_err(unavailable)?;

        let baud_rate = port.baud_rate();
        let read_timeout = port.timeout();
        *lock(&shared.writer) = Some(port);
        *lock(&shared.reader) = Some(reader);

        info!("Connected to {path} at {baud_rate} baud");
        Ok(Self {
            path,
            baud_rate,
            read_timeout,
            shared,
            state: RawReplState::Friendly,
            timing: options
                .timing
                .clone(),
        })
    }

    /// Device path this connection was opened on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Line rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Read timeout of the underlying port.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Whether the transport is still usable.
    pub fn is_open(&self) -> bool {
        self.shared
            .connected
            .load(Ordering::Acquire)
    }

    /// Current raw REPL state.
    pub fn state(&self) -> RawReplState {
        self.state
    }

    /// Queue of received bytes.
    pub fn queue(&self) -> &InboundQueue {
        &self.shared.queue
    }

    /// Write bytes to the device without waiting for any acknowledgement.
    pub fn write(&self, bytes: &[u8]) -> Result<(), IoError> {
        self.shared
            .write(bytes)
    }

    /// Register the live terminal callback.
    ///
    /// Chunks are forwarded only while the session is in friendly mode; the
    /// raw REPL session detaches the callback for the duration of a protocol
    /// exchange.
    pub fn subscribe_terminal(&self, sink: ByteSink) {
        self.shared
            .subscriber
            .set(sink);
        self.shared
            .subscriber
            .set_attached(self.state == RawReplState::Friendly && self.is_open());
    }

    /// Remove the live terminal callback.
    pub fn unsubscribe_terminal(&self) {
        self.shared
            .subscriber
            .set_attached(false);
        self.shared
            .subscriber
            .clear();
    }

    /// Whether the terminal callback currently receives bytes.
    pub fn terminal_attached(&self) -> bool {
        self.shared
            .subscriber
            .is_attached()
    }

    /// The terminal subscriber slot, for echoing protocol output to it.
    pub(crate) fn terminal_subscriber(&self) -> Arc<Subscriber> {
        self.shared
            .subscriber
            .clone()
    }

    pub(crate) fn detach_terminal(&self) {
        self.shared
            .subscriber
            .set_attached(false);
    }

    pub(crate) fn attach_terminal(&self) {
        if self.is_open()
            && self
                .shared
                .subscriber
                .is_set()
        {
            self.shared
                .subscriber
                .set_attached(true);
        }
    }

    /// Register the health callback, invoked with `false` if the transport fails.
    pub fn on_health_change(&self, callback: HealthCallback) {
        *lock(&self.shared.health) = Some(callback);
    }

    /// Handle that can close this connection from another thread.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            shared: self
                .shared
                .clone(),
        }
    }

    /// Handle that can interrupt the board from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            shared: self
                .shared
                .clone(),
        }
    }

    /// Stop the reader, then release the transport. Idempotent.
    pub fn close(&mut self) {
        self.shared
            .close();
        self.state = RawReplState::Friendly;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.path)
            .field("baud_rate", &self.baud_rate)
            .field("state", &self.state)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared
            .close();
    }
}
