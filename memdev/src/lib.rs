pub mod beacon;
pub mod config;
pub mod diag;
pub mod error;
pub mod node;
pub mod readiness;
pub mod registry;
pub mod rig;
pub mod stream;
pub mod units;
pub mod worker;

// Re-export the error type for convenience
pub use error::DeviceError;

// Re-export configuration for convenience
pub use config::Config;

// Re-export the device core types for convenience
pub use stream::{ControlRequest, Credentials, Handle, Readiness, Stream, MAX_CONTROL_TEXT};

// Re-export the seek origin so callers need no direct embedded-io import
pub use embedded_io::SeekFrom;

// Re-export registry and node types for convenience
pub use node::{NodeClient, NodeHost, NodeRequest, SessionFd};
pub use registry::Registry;

// Re-export the pools and the assembled rig
pub use beacon::BeaconSet;
pub use rig::Rig;
pub use units::{UnitCtx, UnitFn, UnitPool};
pub use worker::WorkerPool;
