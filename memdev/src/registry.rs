//! Stream registry
//!
//! Fixed, ordered set of named streams built once at startup. Names are
//! `<prefix><index>`; the set and the names never change after
//! construction, only the stream contents do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::error::DeviceError;
use crate::readiness::{ReadinessQueueArc, SignalId};
use crate::stream::{Credentials, Handle, Stream};

pub struct Registry {
    prefix: String,
    ceiling: usize,
    streams: Vec<Arc<Stream>>,
    queue: ReadinessQueueArc,
    torn_down: AtomicBool,
}

impl Registry {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let queue = ReadinessQueueArc::new();
        let streams: Vec<Arc<Stream>> = (0..config.devices)
            .map(|i| {
                Stream::new(
                    format!("{}{}", config.prefix, i),
                    config.capacity_ceiling,
                    SignalId::new(i as u32),
                    queue.clone(),
                )
            })
            .collect();
        log::info!(
            "registry: {} devices, prefix [{}], ceiling {} bytes",
            streams.len(),
            config.prefix,
            config.capacity_ceiling
        );
        Self {
            prefix: config.prefix.clone(),
            ceiling: config.capacity_ceiling,
            streams,
            queue,
            torn_down: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.streams.len()
    }

    /// The ceiling shared by every stream of this registry.
    #[must_use]
    pub fn capacity_ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.streams.iter().map(|s| s.name())
    }

    #[must_use]
    pub fn stream(&self, index: usize) -> Option<&Arc<Stream>> {
        self.streams.get(index)
    }

    /// Resolve a device name to a fresh handle with its cursor at zero.
    ///
    /// The name must be an exact `<prefix><digits>` entry inside the
    /// registered range; anything else is `NotFound`. Opening mutates no
    /// stream state.
    pub fn open(&self, name: &str, creds: Credentials) -> Result<Handle, DeviceError> {
        let index = self.parse_index(name).ok_or(DeviceError::NotFound)?;
        let stream = self.streams.get(index).ok_or(DeviceError::NotFound)?;
        log::debug!("registry: open [{}] (index {})", name, index);
        Ok(Handle::new(Arc::clone(stream), creds))
    }

    fn parse_index(&self, name: &str) -> Option<usize> {
        let rest = name.strip_prefix(&self.prefix)?;
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        rest.parse().ok()
    }

    /// Un-list every readiness signal so parked readers observe teardown
    /// instead of waiting on a vanished device. Idempotent; called
    /// explicitly at shutdown while routers still hold the registry, and
    /// again from drop for the direct-use case.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for stream in &self.streams {
            self.queue.unlist(stream.signal());
        }
        log::info!("registry: torn down");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.teardown();
    }
}
