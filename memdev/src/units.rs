//! Execution units
//!
//! A fixed pool of dedicated threads standing in for independently
//! schedulable processor contexts. Each unit consumes jobs from its own
//! channel and runs them to completion without interleaving; that
//! single-threaded loop is what makes the broadcast and quiescence
//! guarantees possible.
//!
//! Two primitives are offered: [`UnitPool::broadcast`] runs a callback on
//! every live unit and returns after the last completion;
//! [`UnitPool::run_exclusive`] parks all units but one and runs a callback
//! on the survivor while the rest are provably not executing anything.

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot};

use crate::error::DeviceError;

/// Context handed to every unit callback.
#[derive(Debug, Clone, Copy)]
pub struct UnitCtx {
    /// Index of the unit running the callback.
    pub unit: usize,
}

/// Callback type shared across units.
pub type UnitFn = Arc<dyn Fn(&UnitCtx) + Send + Sync>;

enum Job {
    /// Run the callback, then acknowledge completion.
    Call {
        f: UnitFn,
        done: oneshot::Sender<()>,
    },
    /// Acknowledge the park, then block until released.
    Park {
        acked: oneshot::Sender<()>,
        released: oneshot::Receiver<()>,
    },
}

pub struct UnitPool {
    senders: Mutex<Vec<mpsc::UnboundedSender<Job>>>,
    joins: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl UnitPool {
    /// Spawn `count` unit threads named `unit/<index>`.
    pub fn start(count: usize) -> Result<Self, DeviceError> {
        let mut senders = Vec::with_capacity(count);
        let mut joins = Vec::with_capacity(count);
        for unit in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            let join = thread::Builder::new()
                .name(format!("unit/{unit}"))
                .spawn(move || unit_main(unit, rx))
                .map_err(|e| {
                    log::error!("units.start: spawning unit/{unit} failed: {e}");
                    DeviceError::ResourceExhausted
                })?;
            senders.push(tx);
            joins.push(join);
        }
        log::info!("units: {count} execution units up");
        Ok(Self {
            senders: Mutex::new(senders),
            joins: Mutex::new(joins),
        })
    }

    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.senders.lock().len()
    }

    /// Run `f` once on every live unit; returns the number of units that
    /// completed it.
    ///
    /// A unit whose channel is already closed is skipped silently, the
    /// accepted enumeration/offline race.
    pub async fn broadcast(&self, f: UnitFn) -> usize {
        let senders = self.senders.lock().clone();
        let mut acks = Vec::with_capacity(senders.len());
        for (unit, tx) in senders.iter().enumerate() {
            let (done_tx, done_rx) = oneshot::channel();
            let job = Job::Call {
                f: Arc::clone(&f),
                done: done_tx,
            };
            if tx.send(job).is_ok() {
                acks.push(done_rx);
            } else {
                log::debug!("units.broadcast: unit/{unit} offline, skipped");
            }
        }
        let completed = join_all(acks)
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count();
        log::debug!("units.broadcast: completed on {completed} units");
        completed
    }

    /// Quiesce the pool: park every unit but one, run `f` on the survivor
    /// while the others are blocked, then release everyone.
    ///
    /// Every parked unit acknowledges before `f` starts. If quiescence
    /// cannot be established (no live unit, or one lost mid-setup) the
    /// parked units are released and `ResourceExhausted` is returned; `f`
    /// is never invoked in that case.
    pub async fn run_exclusive(&self, f: UnitFn) -> Result<(), DeviceError> {
        let senders = self.senders.lock().clone();

        // The lowest-indexed live unit runs the callback; nothing depends
        // on the choice.
        let runner = senders
            .iter()
            .position(|tx| !tx.is_closed())
            .ok_or(DeviceError::ResourceExhausted)?;

        let mut acks = Vec::new();
        let mut releases = Vec::new();
        for (unit, tx) in senders.iter().enumerate() {
            if unit == runner {
                continue;
            }
            let (ack_tx, ack_rx) = oneshot::channel();
            let (rel_tx, rel_rx) = oneshot::channel();
            let job = Job::Park {
                acked: ack_tx,
                released: rel_rx,
            };
            if tx.send(job).is_ok() {
                acks.push((unit, ack_rx));
                releases.push(rel_tx);
            } else {
                log::debug!("units.quiesce: unit/{unit} offline, skipped");
            }
        }

        for (unit, ack) in acks {
            if ack.await.is_err() {
                log::warn!("units.quiesce: unit/{unit} lost before acknowledging, aborting");
                release_units(releases);
                return Err(DeviceError::ResourceExhausted);
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        let call = Job::Call { f, done: done_tx };
        if senders[runner].send(call).is_err() {
            log::warn!("units.quiesce: runner unit/{runner} lost, aborting");
            release_units(releases);
            return Err(DeviceError::ResourceExhausted);
        }
        let ran = done_rx.await.is_ok();
        release_units(releases);
        if ran {
            Ok(())
        } else {
            log::warn!("units.quiesce: runner unit/{runner} lost mid-callback");
            Err(DeviceError::ResourceExhausted)
        }
    }

    /// Close every channel and join the unit threads. Jobs already queued
    /// drain first; later calls see an empty pool.
    pub async fn shutdown(&self) {
        self.senders.lock().clear();
        let joins: Vec<_> = self.joins.lock().drain(..).collect();
        for join in joins {
            match tokio::task::spawn_blocking(move || join.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => log::error!("units.shutdown: a unit thread panicked"),
                Err(e) => log::error!("units.shutdown: join task failed: {e}"),
            }
        }
        log::info!("units: pool down");
    }
}

impl Drop for UnitPool {
    fn drop(&mut self) {
        // Closing the channels is enough for the threads to drain and
        // exit; joining is only done in shutdown.
        self.senders.lock().clear();
    }
}

fn release_units(releases: Vec<oneshot::Sender<()>>) {
    for rel in releases {
        let _ = rel.send(());
    }
}

fn unit_main(unit: usize, mut rx: mpsc::UnboundedReceiver<Job>) {
    log::debug!("unit/{unit}: up");
    while let Some(job) = rx.blocking_recv() {
        match job {
            Job::Call { f, done } => {
                let ctx = UnitCtx { unit };
                f(&ctx);
                let _ = done.send(());
            }
            Job::Park { acked, released } => {
                let _ = acked.send(());
                // Blocks until the coordinator releases the pool; an error
                // means the coordinator aborted, resume either way.
                let _ = released.blocking_recv();
            }
        }
    }
    log::debug!("unit/{unit}: down");
}
