//! Shared inbound byte queue.
//!
//! The background reader appends every received chunk; whoever currently owns
//! the protocol exchange waits on it. Waits are bounded by a deadline and wake
//! up immediately when the queue is closed, which is how in-flight operations
//! learn that the connection went away.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::debug;

/// Upper bound on buffered bytes before the oldest ones are dropped.
///
/// In friendly mode nobody drains the queue (the terminal is fed directly by
/// the reader), so it has to be bounded.
pub const DEFAULT_QUEUE_LIMIT: usize = 4 * 1024 * 1024;

/// How often a blocked wait re-checks the global interrupt checker.
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

/// Why a wait on the queue ended without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline passed.
    TimedOut,
    /// The queue was closed or the embedding application requested interruption.
    Closed,
}

#[derive(Debug)]
struct QueueState {
    bytes: VecDeque<u8>,
    closed: bool,
    limit: usize,
}

/// Ordered, thread-safe sequence of received bytes.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone)]
pub struct InboundQueue {
    inner: Arc<(Mutex<QueueState>, Condvar)>,
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundQueue {
    /// Create an empty queue with the default size limit.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_QUEUE_LIMIT)
    }

    /// Create an empty queue holding at most `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(QueueState {
                    bytes: VecDeque::new(),
                    closed: false,
                    limit: limit.max(1),
                }),
                Condvar::new(),
            )),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a received chunk, preserving order.
    pub fn push(&self, chunk: &[u8]) {
        let mut state = self.state();
        state
            .bytes
            .extend(chunk.iter().copied());

        let overflow = state
            .bytes
            .len()
            .saturating_sub(state.limit);
        if overflow > 0 {
            debug!("Inbound queue full, dropping {overflow} oldest bytes");
            state
                .bytes
                .drain(..overflow);
        }
        drop(state);
        self.inner
            .1
            .notify_all();
    }

    /// Discard everything buffered. Returns the number of bytes dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        let dropped = state.bytes.len();
        state
            .bytes
            .clear();
        dropped
    }

    /// Take everything buffered.
    pub fn drain(&self) -> Vec<u8> {
        self.state()
            .bytes
            .drain(..)
            .collect()
    }

    /// Copy of the buffered bytes, leaving them in place.
    pub fn contents(&self) -> Vec<u8> {
        self.state()
            .bytes
            .iter()
            .copied()
            .collect()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.state().bytes.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the queue closed and wake every waiter.
    pub fn close(&self) {
        self.state().closed = true;
        self.inner
            .1
            .notify_all();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Wait until `check` returns `Some` for the buffered bytes.
    ///
    /// `check` sees the whole buffer each time new bytes arrive and must not
    /// block. Nothing is consumed. Data that already satisfies `check` wins
    /// over a closed queue or an expired deadline.
    pub fn wait_until<T, F>(&self, deadline: Instant, mut check: F) -> Result<T, WaitError>
    where
        F: FnMut(&[u8]) -> Option<T>,
    {
        let mut state = self.state();
        loop {
            if let Some(found) = check(state.bytes.make_contiguous()) {
                return Ok(found);
            }
            if state.closed || crate::is_interrupted_requested() {
                return Err(WaitError::Closed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::TimedOut);
            }
            let slice = (deadline - now).min(INTERRUPT_POLL);
            state = self
                .inner
                .1
                .wait_timeout(state, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wait until at least one byte is buffered, then take everything.
    pub fn wait_drain(&self, deadline: Instant) -> Result<Vec<u8>, WaitError> {
        self.wait_until(deadline, |bytes| (!bytes.is_empty()).then_some(()))?;
        Ok(self.drain())
    }
}
