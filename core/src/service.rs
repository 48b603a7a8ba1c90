//! Service kinds and the service registry
//!
//! A service is a unit of work with a declared type and a variant. Three
//! execution shapes exist, each with its own trait:
//!
//! - [`PermanentService`]: owns its concurrency; the framework only calls
//!   `start` and `stop`.
//! - [`BlockingService`]: implements a main loop in `run` plus optional
//!   `on_start`/`on_stop` hooks. The framework owns a driver task that runs
//!   the hooks around `run` and cancels `run` on stop. The shape has no
//!   start/stop to override, which is exactly the structural invariant the
//!   kind demands.
//! - [`SingleShotService`]: implements `execute`, driven once to a
//!   terminal state.
//!
//! Service types become instantiable by registering a constructor in a
//! [`ServiceRegistry`]; nothing relies on import-time side effects. All
//! kinds are cooperative: blocking synchronous I/O inside a service stalls
//! the whole in-process scheduler and is a bug in the service.

use crate::config::{ConfigSchema, ResolvedConfig};
use crate::error::Result;
use crate::monitor::Monitor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Runtime environment handed to every service hook
#[derive(Clone)]
pub struct ServiceContext {
    /// Identity of the instance (`{type}.{variant}`)
    pub service_id: String,
    /// The instance's monitor; services set status, add children and
    /// track tasks through it
    pub monitor: Monitor,
    /// Effective configuration of the instance
    pub config: ResolvedConfig,
}

/// Service with custom concurrency
#[async_trait]
pub trait PermanentService: Send {
    /// Bring the service up; spawn whatever tasks it needs
    async fn start(&mut self, ctx: &ServiceContext) -> Result<()>;

    /// Tear the service down
    async fn stop(&mut self, ctx: &ServiceContext) -> Result<()>;
}

/// Service with a framework-driven main loop
#[async_trait]
pub trait BlockingService: Send {
    /// Called before the main loop starts
    async fn on_start(&mut self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// The main loop; runs until completion or cancellation
    ///
    /// Cancellation drops the future at an await point; cleanup belongs in
    /// `on_stop`, which runs on every exit path.
    async fn run(&mut self, ctx: &ServiceContext) -> Result<()>;

    /// Called after the main loop finished or was cancelled
    async fn on_stop(&mut self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }
}

/// Service executed once
#[async_trait]
pub trait SingleShotService: Send {
    /// Do the work; return classifies the stop as clean or failed
    async fn execute(&mut self, ctx: &ServiceContext) -> Result<()>;
}

/// Execution shape of a service type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Custom concurrency via start/stop
    Permanent,
    /// Framework-driven main loop
    BlockingLoop,
    /// Driven once to a terminal state
    SingleShot,
}

/// A freshly constructed, not yet started service
pub enum ServiceInstance {
    /// Custom concurrency
    Permanent(Box<dyn PermanentService>),
    /// Framework-driven loop
    Blocking(Box<dyn BlockingService>),
    /// One-time execution
    SingleShot(Box<dyn SingleShotService>),
}

impl ServiceInstance {
    /// The execution shape of this instance
    #[must_use]
    pub fn kind(&self) -> ServiceKind {
        match self {
            ServiceInstance::Permanent(_) => ServiceKind::Permanent,
            ServiceInstance::Blocking(_) => ServiceKind::BlockingLoop,
            ServiceInstance::SingleShot(_) => ServiceKind::SingleShot,
        }
    }
}

impl std::fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServiceInstance({:?})", self.kind())
    }
}

/// Constructor producing a fresh instance of a service type
pub type ServiceFactory = Arc<dyn Fn() -> ServiceInstance + Send + Sync>;

struct RegistryEntry {
    factory: ServiceFactory,
    schema: ConfigSchema,
}

/// Explicit registry mapping service types to constructors
///
/// Modules contribute entries by calling the `register_*` methods at
/// program start; the loader consults the registry by type name.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl ServiceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for a service type
    pub fn register<F>(&self, service_type: &str, factory: F)
    where
        F: Fn() -> ServiceInstance + Send + Sync + 'static,
    {
        self.register_with_schema(service_type, ConfigSchema::new(), factory);
    }

    /// Register a constructor together with its config schema
    pub fn register_with_schema<F>(&self, service_type: &str, schema: ConfigSchema, factory: F)
    where
        F: Fn() -> ServiceInstance + Send + Sync + 'static,
    {
        self.entries.write().unwrap().insert(
            service_type.to_string(),
            RegistryEntry {
                factory: Arc::new(factory),
                schema,
            },
        );
    }

    /// Whether a type is registered
    #[must_use]
    pub fn contains(&self, service_type: &str) -> bool {
        self.entries.read().unwrap().contains_key(service_type)
    }

    /// Registered type names, sorted
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct a fresh instance of a type, with its config schema
    #[must_use]
    pub fn create(&self, service_type: &str) -> Option<(ServiceInstance, ConfigSchema)> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(service_type)?;
        Some(((entry.factory)(), entry.schema.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldKind;
    use serde_json::json;

    struct Nop;

    #[async_trait]
    impl SingleShotService for Nop {
        async fn execute(&mut self, _ctx: &ServiceContext) -> Result<()> {
            Ok(())
        }
    }

    struct Loop;

    #[async_trait]
    impl BlockingService for Loop {
        async fn run(&mut self, _ctx: &ServiceContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_create() {
        let registry = ServiceRegistry::new();
        registry.register("nop", || ServiceInstance::SingleShot(Box::new(Nop)));
        registry.register_with_schema(
            "loop",
            ConfigSchema::new().field("period", FieldKind::Float, json!(1.0)),
            || ServiceInstance::Blocking(Box::new(Loop)),
        );

        assert!(registry.contains("nop"));
        assert!(!registry.contains("missing"));
        assert_eq!(registry.types(), ["loop", "nop"]);

        let (instance, _schema) = registry.create("nop").unwrap();
        assert_eq!(instance.kind(), ServiceKind::SingleShot);
        let (instance, schema) = registry.create("loop").unwrap();
        assert_eq!(instance.kind(), ServiceKind::BlockingLoop);
        assert_eq!(schema.fields.len(), 1);
        assert!(registry.create("missing").is_none());
    }
}
