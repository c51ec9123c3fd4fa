//! Background workers
//!
//! Long-lived named threads with an interruptible heartbeat sleep. Worker 0
//! additionally demonstrates elevated real-time scheduling: it asks the host
//! for `SCHED_RR` at maximum priority, logs the outcome, and carries on at
//! default priority when refused. Stopping is cooperative: the stop flag is
//! set, sleepers are woken through the condvar, and every thread is joined.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::diag;
use crate::error::DeviceError;

struct StopSignal {
    stop: Mutex<bool>,
    cv: Condvar,
}

struct WorkerState {
    heartbeats: AtomicU64,
}

pub struct WorkerPool {
    signal: Arc<StopSignal>,
    states: Vec<Arc<WorkerState>>,
    joins: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers named `worker/<index>`, each emitting a
    /// heartbeat every `interval`.
    pub fn start(count: usize, interval: Duration) -> Result<Self, DeviceError> {
        let signal = Arc::new(StopSignal {
            stop: Mutex::new(false),
            cv: Condvar::new(),
        });
        let mut states = Vec::with_capacity(count);
        let mut joins = Vec::with_capacity(count);
        for index in 0..count {
            let state = Arc::new(WorkerState {
                heartbeats: AtomicU64::new(0),
            });
            let worker_state = Arc::clone(&state);
            let worker_signal = Arc::clone(&signal);
            let join = thread::Builder::new()
                .name(format!("worker/{index}"))
                .spawn(move || worker_main(index, interval, &worker_state, &worker_signal))
                .map_err(|e| {
                    log::error!("workers.start: spawning worker/{index} failed: {e}");
                    DeviceError::ResourceExhausted
                })?;
            states.push(state);
            joins.push(join);
        }
        log::info!("workers: {count} up, heartbeat interval {interval:?}");
        Ok(Self {
            signal,
            states,
            joins,
        })
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.states.len()
    }

    /// Heartbeats per worker so far.
    #[must_use]
    pub fn heartbeat_counts(&self) -> Vec<u64> {
        self.states
            .iter()
            .map(|s| s.heartbeats.load(Ordering::Relaxed))
            .collect()
    }

    /// Set the stop flag, wake every sleeper and join all threads. After
    /// this returns no worker is mid-iteration.
    pub async fn stop_and_join(&mut self) {
        {
            let mut stop = self.signal.stop.lock();
            *stop = true;
        }
        self.signal.cv.notify_all();
        for join in self.joins.drain(..) {
            match tokio::task::spawn_blocking(move || join.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => log::error!("workers.stop: a worker thread panicked"),
                Err(e) => log::error!("workers.stop: join task failed: {e}"),
            }
        }
        log::info!("workers: pool down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let mut stop = self.signal.stop.lock();
        *stop = true;
        drop(stop);
        self.signal.cv.notify_all();
    }
}

fn worker_main(index: usize, interval: Duration, state: &WorkerState, signal: &StopSignal) {
    log::info!("worker/{index}: up");
    if index == 0 {
        request_realtime_priority();
    }
    loop {
        // Interruptible sleep: ends early when stop is requested.
        let mut stop = signal.stop.lock();
        if !*stop {
            signal.cv.wait_for(&mut stop, interval);
        }
        if *stop {
            break;
        }
        drop(stop);
        let beats = state.heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("worker/{index}: heartbeat {beats}");
    }
    log::info!("worker/{index}: down");
}

/// Ask the host scheduler for round-robin real-time priority on the calling
/// thread. Refusal (typically: no privilege) is logged and non-fatal.
#[cfg(unix)]
fn request_realtime_priority() {
    diag::log_scheduler_policy("worker/0 before");

    // SAFETY: plain libc queries and a well-formed sched_param; pthread_self
    // always names the calling thread.
    let max = unsafe { libc::sched_get_priority_max(libc::SCHED_RR) };
    if max < 0 {
        log::warn!("worker/0: no real-time priority range on this host, continuing at default");
        return;
    }
    let param = libc::sched_param {
        sched_priority: max,
    };
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param) };
    if rc == 0 {
        log::info!("worker/0: real-time priority {max} granted");
    } else {
        log::warn!("worker/0: real-time priority refused (err {rc}), continuing at default");
    }

    diag::log_scheduler_policy("worker/0 after");
}

#[cfg(not(unix))]
fn request_realtime_priority() {
    log::info!("worker/0: priority elevation not supported on this target");
}
