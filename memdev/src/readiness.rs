//! Readiness signals
//!
//! Wake-up channel between stream writers and blocked/polling readers.
//! Each stream owns one signal; the queue is shared by all streams of a
//! registry.
//!
//! # Waiting without losing a wake-up
//!
//! The naive workflow is:
//!
//! 10. Reader: check `cursor < length`
//! 20. Reader: register as a waiter
//! 30. Writer: append, then wake the waiters
//!
//! With the writer on another thread, its wake (30) can land between the
//! reader's check (10) and registration (20), and the reader then waits for
//! a notification that already happened. The reader therefore acquires the
//! queue lock to make check-and-register atomic, re-checking the condition
//! under the lock:
//!
//! ```ignore
//! if stream.readable(cursor) {
//!     return;
//! }
//! let lock = queue.get_lock();
//! if !stream.readable(cursor) {
//!     queue.wait_async(signal, "reader", lock).await;
//!     // the lock is consumed by wait_async and released before awaiting
//! }
//! ```
//!
//! Writers never hold the stream lock while taking the queue lock, so the
//! two locks never nest in the writer direction and no cycle exists.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Identity of one stream's readiness signal within its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId {
    index: u32,
}

impl SignalId {
    #[must_use]
    pub fn new(index: u32) -> Self {
        Self { index }
    }

    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }
}

/// Wake payload: the stream length after the append, or [`TEARDOWN`].
pub type SignalValue = i64;

/// Sent to every waiter when a signal is un-listed at teardown.
pub const TEARDOWN: SignalValue = -1;

struct Waiter {
    sender: tokio::sync::oneshot::Sender<SignalValue>,
    debug_hint: String,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("debug_hint", &self.debug_hint)
            .finish_non_exhaustive()
    }
}

pub struct QueueState {
    whitelist: HashMap<SignalId, String>,
    waiters: HashMap<SignalId, Vec<Waiter>>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            whitelist: HashMap::new(),
            waiters: HashMap::new(),
        }
    }
}

/// Thread-safe readiness queue shared by the streams of one registry.
#[derive(Clone)]
pub struct ReadinessQueueArc {
    inner: Arc<Mutex<QueueState>>,
}

impl ReadinessQueueArc {
    #[must_use]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueState::new())),
        }
    }

    /// Get the lock for atomic condition-check + register operations.
    pub fn get_lock(&self) -> parking_lot::MutexGuard<'_, QueueState> {
        self.inner.lock()
    }

    /// Register a signal. Wakes for unknown signals are dropped silently.
    pub fn whitelist(&self, signal: SignalId, debug_hint: &str) {
        let mut state = self.inner.lock();
        if let Some(old_hint) = state.whitelist.insert(signal, debug_hint.to_string()) {
            log::warn!("readiness.whitelist: signal {signal:?} already listed (was: '{old_hint}')");
        }
    }

    /// Unregister a signal at stream teardown.
    ///
    /// Every waiter still parked on the signal is woken with [`TEARDOWN`].
    pub fn unlist(&self, signal: SignalId) {
        let mut state = self.inner.lock();
        if state.whitelist.remove(&signal).is_none() {
            log::warn!("readiness.unlist: signal {signal:?} not listed");
        }
        let waiters = state.waiters.remove(&signal).unwrap_or_default();
        drop(state);

        for waiter in waiters {
            if waiter.sender.send(TEARDOWN).is_err() {
                log::debug!(
                    "readiness.unlist: waiter gone for signal {:?} (hint: {})",
                    signal,
                    waiter.debug_hint
                );
            }
        }
    }

    /// Wake everyone parked on `signal`. Called by writers after an append,
    /// outside the stream lock.
    pub fn notify(&self, signal: SignalId, value: SignalValue) {
        let mut state = self.inner.lock();
        let waiters = state.waiters.remove(&signal).unwrap_or_default();
        log::debug!(
            "readiness.notify: signal {:?}, value={}, waiters: {}",
            signal,
            value,
            waiters.len()
        );
        drop(state);

        for waiter in waiters {
            // A dropped receiver just means the reader gave up waiting.
            if waiter.sender.send(value).is_err() {
                log::debug!(
                    "readiness.notify: waiter gone for signal {:?} (hint: {})",
                    signal,
                    waiter.debug_hint
                );
            }
        }
    }

    /// Park until `signal` is next notified.
    ///
    /// Precondition: the caller holds the queue lock and has re-checked its
    /// wait condition under it. The lock is consumed and released before the
    /// returned future is awaited, see the module documentation.
    ///
    /// An un-listed signal resolves immediately so that a teardown race
    /// cannot strand the caller.
    pub fn wait_async(
        &self,
        signal: SignalId,
        debug_hint: &str,
        mut lock: parking_lot::MutexGuard<'_, QueueState>,
    ) -> impl std::future::Future<Output = SignalValue> + Send {
        let (tx, rx) = tokio::sync::oneshot::channel();

        if lock.whitelist.contains_key(&signal) {
            let waiter = Waiter {
                sender: tx,
                debug_hint: debug_hint.to_string(),
            };
            lock.waiters.entry(signal).or_default().push(waiter);
            drop(lock);
        } else {
            drop(lock);
            let _ = tx.send(TEARDOWN);
        }

        // The sender can only disappear without sending if the whole queue
        // is dropped mid-wait, which is a shutdown-ordering bug upstream;
        // report teardown in that case too.
        async move { rx.await.unwrap_or(TEARDOWN) }
    }
}
