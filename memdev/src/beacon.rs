//! Periodic beacons
//!
//! Self-re-arming timers that emit a liveness record every interval. The
//! next deadline is computed after the current firing completes, so a slow
//! firing shifts the schedule rather than bunching deadlines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct BeaconState {
    fired: AtomicU64,
}

pub struct BeaconSet {
    token: CancellationToken,
    states: Vec<Arc<BeaconState>>,
    joins: Vec<tokio::task::JoinHandle<()>>,
}

impl BeaconSet {
    /// Arm `count` beacons, each firing every `interval`.
    #[must_use]
    pub fn arm(count: usize, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let mut states = Vec::with_capacity(count);
        let mut joins = Vec::with_capacity(count);
        for index in 0..count {
            let state = Arc::new(BeaconState {
                fired: AtomicU64::new(0),
            });
            let join = tokio::spawn(beacon_main(
                index,
                interval,
                Arc::clone(&state),
                token.child_token(),
            ));
            states.push(state);
            joins.push(join);
        }
        log::info!("beacons: {count} armed, interval {interval:?}");
        Self {
            token,
            states,
            joins,
        }
    }

    /// Firings per beacon so far.
    #[must_use]
    pub fn fire_counts(&self) -> Vec<u64> {
        self.states
            .iter()
            .map(|s| s.fired.load(Ordering::Relaxed))
            .collect()
    }

    /// Cancel every beacon and wait out in-flight firings. No beacon fires
    /// after this returns.
    pub async fn cancel(&mut self) {
        self.token.cancel();
        for join in self.joins.drain(..) {
            if let Err(e) = join.await {
                log::error!("beacons.cancel: task failed: {e}");
            }
        }
        log::info!("beacons: canceled");
    }
}

impl Drop for BeaconSet {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn beacon_main(
    index: usize,
    interval: Duration,
    state: Arc<BeaconState>,
    token: CancellationToken,
) {
    let mut deadline = Instant::now() + interval;
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep_until(deadline) => {
                let fired = state.fired.fetch_add(1, Ordering::Relaxed) + 1;
                let thread = std::thread::current();
                log::info!(
                    "beacon {index}: fired ({fired} total) on {:?} [{}]",
                    thread.id(),
                    thread.name().unwrap_or("unnamed")
                );
                // Re-arm relative to the end of this firing.
                deadline = Instant::now() + interval;
            }
        }
    }
    log::debug!(
        "beacon {index}: canceled after {} firings",
        state.fired.load(Ordering::Relaxed)
    );
}
