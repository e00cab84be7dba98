//! Background reader thread.
//!
//! One reader runs per open connection. It polls the transport, appends every
//! chunk to the [`InboundQueue`] and, while a terminal subscriber is attached,
//! forwards the chunk to it immediately. A transport failure stops the loop,
//! closes the queue and fires the health callback with `connected = false`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::IoError;
use crate::port::Port;
use crate::queue::InboundQueue;

/// Longest allowed pause between two polls of the transport.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Callback receiving live bytes for display.
pub type ByteSink = Box<dyn FnMut(&[u8]) + Send>;

/// Callback receiving connection health changes.
pub type HealthCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// The live-subscriber slot shared between the reader and the connection.
///
/// The raw REPL session detaches it before taking over the byte stream and
/// attaches it again once the device is back in friendly mode.
#[derive(Default)]
pub struct Subscriber {
    sink: Mutex<Option<ByteSink>>,
    attached: AtomicBool,
}

impl Subscriber {
    /// Install (or replace) the sink.
    pub fn set(&self, sink: ByteSink) {
        *self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Remove the sink.
    pub fn clear(&self) {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Whether a sink is installed.
    pub fn is_set(&self) -> bool {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start or stop forwarding to the sink.
    pub fn set_attached(&self, attached: bool) {
        self.attached
            .store(attached, Ordering::Release);
    }

    /// Whether chunks are currently forwarded.
    pub fn is_attached(&self) -> bool {
        self.attached
            .load(Ordering::Acquire)
    }

    fn forward(&self, chunk: &[u8]) {
        if self.is_attached() {
            self.deliver(chunk);
        }
    }

    /// Hand `chunk` to the sink whether or not it is attached.
    pub(crate) fn deliver(&self, chunk: &[u8]) {
        if let Some(sink) = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            sink(chunk);
        }
    }
}

/// State the reader shares with its connection.
#[derive(Clone)]
pub struct ReaderContext {
    /// Queue every chunk is appended to.
    pub queue: InboundQueue,
    /// Live display subscriber.
    pub subscriber: Arc<Subscriber>,
    /// Health callback slot.
    pub health: Arc<Mutex<Option<HealthCallback>>>,
    /// Cleared when the transport fails.
    pub connected: Arc<AtomicBool>,
}

impl ReaderContext {
    fn report_failure(&self) {
        self.connected
            .store(false, Ordering::Release);
        self.queue
            .close();
        let callback = self
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(false);
        }
    }
}

/// Handle to a running reader thread.
pub struct BackgroundReader {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundReader {
    /// Spawn the reader loop on its own thread.
    ///
    /// `poll_interval` is clamped to [`MAX_POLL_INTERVAL`].
    pub fn spawn(
        mut port: Box<dyn Port>,
        ctx: ReaderContext,
        poll_interval: Duration,
    ) -> Result<Self, IoError> {
        let running = Arc::new(AtomicBool::new(true));
        let running_reader = running.clone();
        let poll_interval = poll_interval.min(MAX_POLL_INTERVAL);
        let name = port
            .name()
            .to_string();

        let handle = thread::Builder::new()
            .name(format!("replflash-reader {name}"))
            .spawn(move || {
                debug!("Reader started on {name}");
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    poll_loop(port.as_mut(), &ctx, &running_reader, poll_interval)
                }));

                match outcome {
                    Ok(Ok(())) => debug!("Reader on {name} stopped"),
                    Ok(Err(e)) => {
                        warn!("Transport failure on {name}: {e}");
                        ctx.report_failure();
                    },
                    Err(_) => {
                        warn!("Reader on {name} panicked");
                        ctx.report_failure();
                    },
                }
                if let Err(e) = port.close() {
                    trace!("Closing reader handle failed: {e}");
                }
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Whether the loop thread is still alive.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Ask the loop to stop and wait for it.
    ///
    /// The loop re-checks the stop flag at least every poll interval, so the
    /// join is bounded. Safe to call more than once.
    pub fn stop(&mut self) {
        self.running
            .store(false, Ordering::Release);
        if let Some(handle) = self
            .handle
            .take()
        {
            if handle
                .join()
                .is_err()
            {
                warn!("Reader thread ended with a panic");
            }
        }
    }
}

impl Drop for BackgroundReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    port: &mut dyn Port,
    ctx: &ReaderContext,
    running: &AtomicBool,
    poll_interval: Duration,
) -> Result<(), IoError> {
    while running.load(Ordering::Acquire) {
        let chunk = port.read_available()?;
        if chunk.is_empty() {
            thread::sleep(poll_interval);
            continue;
        }

        trace!("Received {} bytes", chunk.len());
        ctx.queue
            .push(&chunk);
        ctx.subscriber
            .forward(&chunk);
    }
    Ok(())
}
