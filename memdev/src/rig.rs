//! The assembled rig
//!
//! Brings every subsystem up in a fixed order (unit pool with its
//! broadcast and quiescence exercise, stream registry, device node,
//! beacons, workers) and tears them down again node first, then beacons,
//! then workers, then the unit pool. A failure during bring-up unwinds
//! whatever already started before the error is reported.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::beacon::BeaconSet;
use crate::config::Config;
use crate::diag;
use crate::error::DeviceError;
use crate::node::{NodeClient, NodeHost};
use crate::registry::Registry;
use crate::units::{UnitCtx, UnitPool};
use crate::worker::WorkerPool;

pub struct Rig {
    config: Config,
    units: UnitPool,
    registry: Arc<Registry>,
    client: NodeClient,
    router: tokio::task::JoinHandle<()>,
    router_token: CancellationToken,
    beacons: BeaconSet,
    workers: WorkerPool,
}

impl Rig {
    /// Bring the whole system up. On failure every subsystem already
    /// started is torn down again before the error is returned.
    pub async fn start(config: Config) -> Result<Self, DeviceError> {
        diag::startup_report(&config);

        let units = UnitPool::start(config.effective_units())?;

        // One pass over every unit, then one quiesced callback: the
        // startup smoke exercise of the scheduling primitives.
        let reached = units
            .broadcast(Arc::new(|ctx: &UnitCtx| {
                log::info!("unit {}: broadcast touch", ctx.unit);
            }))
            .await;
        info!(reached, "rig: broadcast exercise done");

        if let Err(e) = units
            .run_exclusive(Arc::new(|ctx: &UnitCtx| {
                log::info!("unit {}: exclusive touch, pool quiesced", ctx.unit);
            }))
            .await
        {
            error!(label = e.as_label(), "rig: quiescence exercise failed");
            units.shutdown().await;
            return Err(e);
        }

        let registry = Arc::new(Registry::new(&config));

        let host = match NodeHost::new(Arc::clone(&registry)) {
            Ok(host) => host,
            Err(e) => {
                error!(label = e.as_label(), "rig: node registration failed");
                registry.teardown();
                units.shutdown().await;
                return Err(e);
            }
        };
        let client = host.client();
        let router_token = CancellationToken::new();
        let router = tokio::spawn(host.run(router_token.clone()));

        let beacons = BeaconSet::arm(config.beacons, config.beacon_interval);

        let workers = match WorkerPool::start(config.workers, config.worker_interval) {
            Ok(workers) => workers,
            Err(e) => {
                error!(label = e.as_label(), "rig: worker start failed, unwinding");
                let mut beacons = beacons;
                beacons.cancel().await;
                registry.teardown();
                router_token.cancel();
                drop(client);
                if let Err(join_err) = router.await {
                    error!("rig: router task failed: {join_err}");
                }
                units.shutdown().await;
                return Err(e);
            }
        };

        info!("rig: up");
        Ok(Self {
            config,
            units,
            registry,
            client,
            router,
            router_token,
            beacons,
            workers,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A fresh client for the device node.
    #[must_use]
    pub fn client(&self) -> NodeClient {
        self.client.clone()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn units(&self) -> &UnitPool {
        &self.units
    }

    #[must_use]
    pub fn beacons(&self) -> &BeaconSet {
        &self.beacons
    }

    #[must_use]
    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Tear the rig down: node, beacons, workers, units, in that order.
    /// Parked readiness waits are woken by the registry teardown before the
    /// router is stopped.
    pub async fn shutdown(self) {
        info!("rig: shutting down");
        let Self {
            units,
            registry,
            client,
            router,
            router_token,
            mut beacons,
            mut workers,
            ..
        } = self;

        registry.teardown();
        router_token.cancel();
        drop(client);
        if let Err(e) = router.await {
            error!("rig: router task failed: {e}");
        }

        beacons.cancel().await;
        workers.stop_and_join().await;
        units.shutdown().await;
        info!("rig: down");
    }
}
