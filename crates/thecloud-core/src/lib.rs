//! thecloud-core: shared vocabulary for the TheCloud orchestration engines.
//!
//! Holds the pieces every engine crate agrees on:
//!
//! - `CloudConfig`: the `thecloud.toml` daemon configuration
//! - `Principal` / `OpContext`: the tenant identity and cancellation scope
//!   threaded explicitly through every backend call
//! - Backend collaborator traits (compute, network, storage, load
//!   balancing, events, metrics) and the values they return
//! - `Clock`: injected time source for cooldown and backoff windows

pub mod backend;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod types;

pub use backend::{
    Backends, ComputeBackend, EventSink, LoadBalancerBackend, MetricsSource, NetworkBackend,
    StorageBackend,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CloudConfig;
pub use context::{OpContext, Principal};
pub use error::{BackendError, BackendResult, ConfigError};
pub use types::*;
