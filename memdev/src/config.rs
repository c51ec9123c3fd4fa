//! Rig configuration.
//!
//! Load-time tunables collected in an owned struct built once at startup.
//! Environment variables named `MEMDEV_*` override the defaults; malformed
//! values are logged and ignored.

use std::env;
use std::thread;
use std::time::Duration;

pub const DEFAULT_DEVICE_COUNT: usize = 2;
pub const DEFAULT_CAPACITY_CEILING: usize = 8 * 1024 * 1024;
pub const DEFAULT_DEVICE_PREFIX: &str = "memdev";
pub const DEFAULT_BEACON_COUNT: usize = 4;
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_secs(8);
pub const DEFAULT_WORKER_INTERVAL: Duration = Duration::from_secs(8);

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of stream devices to register.
    pub devices: usize,

    /// Capacity ceiling shared by every stream, in bytes.
    pub capacity_ceiling: usize,

    /// Device name prefix; entries are named `<prefix><index>`.
    pub prefix: String,

    /// Periodic beacons to arm.
    pub beacons: usize,

    /// Beacon period.
    pub beacon_interval: Duration,

    /// Background workers to spawn.
    pub workers: usize,

    /// Worker heartbeat period.
    pub worker_interval: Duration,

    /// Execution units in the pool. `0` means one per available CPU.
    pub units: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: DEFAULT_DEVICE_COUNT,
            capacity_ceiling: DEFAULT_CAPACITY_CEILING,
            prefix: DEFAULT_DEVICE_PREFIX.to_string(),
            beacons: DEFAULT_BEACON_COUNT,
            beacon_interval: DEFAULT_BEACON_INTERVAL,
            workers: DEFAULT_WORKER_COUNT,
            worker_interval: DEFAULT_WORKER_INTERVAL,
            units: 0,
        }
    }
}

impl Config {
    /// Defaults with `MEMDEV_*` environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            devices: env_usize("MEMDEV_DEVICES", d.devices),
            capacity_ceiling: env_usize("MEMDEV_CEILING", d.capacity_ceiling),
            prefix: env::var("MEMDEV_PREFIX").unwrap_or(d.prefix),
            beacons: env_usize("MEMDEV_BEACONS", d.beacons),
            beacon_interval: env_millis("MEMDEV_BEACON_INTERVAL_MS", d.beacon_interval),
            workers: env_usize("MEMDEV_WORKERS", d.workers),
            worker_interval: env_millis("MEMDEV_WORKER_INTERVAL_MS", d.worker_interval),
            units: env_usize("MEMDEV_UNITS", d.units),
        }
    }

    /// Unit count with the `0 == every CPU` sentinel resolved.
    #[must_use]
    pub fn effective_units(&self) -> usize {
        if self.units > 0 {
            return self.units;
        }
        thread::available_parallelism().map_or(1, |n| n.get())
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("{key}: ignoring unparsable value [{raw}]");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                log::warn!("{key}: ignoring unparsable value [{raw}]");
                default
            }
        },
        Err(_) => default,
    }
}
