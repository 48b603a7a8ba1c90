//! Supervision and monitoring core for telescope-control services
//!
//! This crate contains the framework proper: the hierarchical monitor, the
//! bus-attached monitor publishing the status/heartbeat/registry protocol,
//! the layered configuration resolver, the per-process context, the service
//! controller state machine, the service kinds and their registry, the
//! launcher with restart supervision, and the read-side discovery client.
//!
//! The concrete message bus is out of scope; everything here consumes the
//! abstract capability from the `bus` crate.

pub mod config;
pub mod context;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod monitor;
#[cfg(unix)]
pub mod process;
pub mod service;
pub mod standalone;

pub use config::{ConfigResolver, ConfigSchema, ResolvedConfig};
pub use context::{ContextOptions, ProcessContext};
pub use controller::{ControllerState, ServiceController};
pub use discovery::{DiscoveryClient, ServiceStage, ServiceView};
pub use error::{Result, TcsError};
pub use launcher::{LaunchMode, Launcher};
pub use monitor::{BusMonitor, Monitor, MonitorContext};
pub use service::{
    BlockingService, PermanentService, ServiceContext, ServiceInstance, ServiceKind,
    ServiceRegistry, SingleShotService,
};

/// Shared helpers for binaries
pub mod utils {
    /// Initialize tracing for a framework binary
    ///
    /// Honours `RUST_LOG` when set, otherwise falls back to `level`.
    pub fn init_tracing(level: &str) {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let _ = fmt().with_env_filter(filter).try_init();
    }
}
