//! Per-process context
//!
//! One [`ProcessContext`] exists per OS process. It owns the single bus
//! connection shared by all in-process controllers, the configuration
//! resolver, and the controller registry. The singleton guarantee is a
//! program-structure contract: the context is constructed once at program
//! entry and passed explicitly to every component.
//!
//! Bootstrap happens in two phases:
//!
//! 1. file + args + environment resolve the bus endpoint
//!    (`bus.host`/`bus.port`, overridable via `BUS_HOST`/`BUS_PORT`)
//! 2. the bus is connected and a bus-sourced configuration layer is pushed
//!    on top, so later lookups see dynamic values
//!
//! When `bus.required` is false, a failed connection degrades the process
//! to busless operation instead of aborting bootstrap.

use crate::config::ConfigResolver;
use crate::controller::ServiceController;
use crate::error::{Result, TcsError};
use crate::service::ServiceRegistry;
use bus::{subjects, Bus, MemoryBus};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a bootstrap configuration request may take
const BUS_CONFIG_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolved bus endpoint for phase two of the bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEndpoint {
    /// Bus host
    pub host: String,
    /// Bus port
    pub port: u16,
    /// Whether bootstrap must fail when the connection does
    pub required: bool,
}

/// Connector turning an endpoint into a live bus handle
pub type BusConnector =
    Box<dyn FnOnce(BusEndpoint) -> BoxFuture<'static, bus::Result<Arc<dyn Bus>>> + Send>;

/// Connector yielding a fresh in-process [`MemoryBus`]
///
/// This is the binding used by tests and single-process deployments; a
/// production deployment injects a connector for its real broker.
#[must_use]
pub fn memory_connector() -> BusConnector {
    Box::new(|_endpoint| Box::pin(async { Ok(Arc::new(MemoryBus::new()) as Arc<dyn Bus>) }))
}

/// Inputs for [`ProcessContext::initialize`]
#[derive(Default)]
pub struct ContextOptions {
    /// Configuration file; `None` runs on defaults and args only
    pub config_file: Option<PathBuf>,
    /// Built-in defaults (lowest precedence)
    pub defaults: Map<String, Value>,
    /// Command-line overrides (highest precedence)
    pub args: Map<String, Value>,
    /// Registry of in-process service constructors
    pub services: Arc<ServiceRegistry>,
}

/// Shared per-process resources
pub struct ProcessContext {
    config: Arc<ConfigResolver>,
    config_file: Option<PathBuf>,
    bus: Option<Arc<dyn Bus>>,
    services: Arc<ServiceRegistry>,
    controllers: Mutex<HashMap<String, Arc<ServiceController>>>,
}

impl ProcessContext {
    /// Run the two-phase bootstrap with the given bus connector
    pub async fn initialize(opts: ContextOptions, connector: BusConnector) -> Result<Arc<Self>> {
        let config = Arc::new(ConfigResolver::new());
        if !opts.defaults.is_empty() {
            config.push_defaults(opts.defaults);
        }
        if let Some(path) = &opts.config_file {
            config.load_file(path)?;
        }
        if !opts.args.is_empty() {
            config.push_args(opts.args);
        }

        let endpoint = Self::bus_endpoint(&config);
        let bus = match connector(endpoint.clone()).await {
            Ok(bus) => {
                info!(host = %endpoint.host, port = endpoint.port, "bus connected");
                Some(bus)
            }
            Err(e) if endpoint.required => {
                error!(host = %endpoint.host, port = endpoint.port, "bus connection failed: {e}");
                return Err(TcsError::Bus(e));
            }
            Err(e) => {
                warn!(
                    host = %endpoint.host,
                    port = endpoint.port,
                    "bus unavailable, continuing without it: {e}"
                );
                None
            }
        };

        if let Some(bus) = &bus {
            Self::fetch_bus_config(bus, &config).await;
        }

        let context = Arc::new(Self {
            config,
            config_file: opts.config_file,
            bus,
            services: opts.services,
            controllers: Mutex::new(HashMap::new()),
        });
        info!("process context initialized");
        Ok(context)
    }

    /// Bootstrap with an already connected bus handle (or none)
    ///
    /// Used by tests and by launchers that share one in-memory bus between
    /// in-process components.
    pub async fn initialize_with_bus(
        opts: ContextOptions,
        bus: Option<Arc<dyn Bus>>,
    ) -> Result<Arc<Self>> {
        match bus {
            Some(bus) => {
                Self::initialize(
                    opts,
                    Box::new(move |_endpoint| Box::pin(async move { Ok(bus) })),
                )
                .await
            }
            None => {
                Self::initialize(
                    opts,
                    Box::new(|_endpoint| {
                        Box::pin(async {
                            Err(bus::BusError::Transport("no bus configured".to_string()))
                        })
                    }),
                )
                .await
            }
        }
    }

    /// Resolve the bus endpoint from phase-one configuration
    #[must_use]
    pub fn bus_endpoint(config: &ConfigResolver) -> BusEndpoint {
        let host = std::env::var("BUS_HOST").ok().unwrap_or_else(|| {
            config
                .get("bus.host")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "localhost".to_string())
        });
        let port = std::env::var("BUS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .or_else(|| {
                config
                    .get("bus.port")
                    .and_then(|v| v.as_u64())
                    .and_then(|p| u16::try_from(p).ok())
            })
            .unwrap_or(4222);
        let required = config
            .get("bus.required")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        BusEndpoint {
            host,
            port,
            required,
        }
    }

    async fn fetch_bus_config(bus: &Arc<dyn Bus>, config: &ConfigResolver) {
        match bus
            .request(subjects::CONFIG_REQUEST, &Value::Null, BUS_CONFIG_TIMEOUT)
            .await
        {
            Ok(Value::Object(map)) => {
                debug!("bus configuration layer loaded ({} keys)", map.len());
                config.push_bus(map);
            }
            Ok(other) => {
                warn!("bus configuration provider returned a non-mapping: {other}");
            }
            Err(e) => {
                debug!("no bus configuration available: {e}");
            }
        }
    }

    /// The configuration resolver
    #[must_use]
    pub fn config(&self) -> &Arc<ConfigResolver> {
        &self.config
    }

    /// Path of the loaded configuration file, if any
    ///
    /// Stored so launchers can pass it on to spawned subprocesses.
    #[must_use]
    pub fn config_file(&self) -> Option<&PathBuf> {
        self.config_file.as_ref()
    }

    /// The shared bus handle, if connected
    #[must_use]
    pub fn bus(&self) -> Option<Arc<dyn Bus>> {
        self.bus.clone()
    }

    /// The in-process service registry
    #[must_use]
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Register a controller under its service id
    pub fn register_controller(&self, controller: Arc<ServiceController>) {
        let service_id = controller.service_id().to_string();
        self.controllers
            .lock()
            .unwrap()
            .insert(service_id.clone(), controller);
        debug!(service_id, "controller registered");
    }

    /// Remove a controller by service id
    pub fn unregister_controller(&self, service_id: &str) {
        if self
            .controllers
            .lock()
            .unwrap()
            .remove(service_id)
            .is_some()
        {
            debug!(service_id, "controller unregistered");
        }
    }

    /// Look up a registered controller
    #[must_use]
    pub fn controller(&self, service_id: &str) -> Option<Arc<ServiceController>> {
        self.controllers.lock().unwrap().get(service_id).cloned()
    }

    /// All registered controllers
    #[must_use]
    pub fn controllers(&self) -> Vec<Arc<ServiceController>> {
        self.controllers.lock().unwrap().values().cloned().collect()
    }

    /// Graceful shutdown: stop every controller, flush publishes, close
    /// the bus
    pub async fn shutdown(&self) {
        info!("shutting down process context");
        let controllers: Vec<Arc<ServiceController>> = {
            let mut map = self.controllers.lock().unwrap();
            map.drain().map(|(_, c)| c).collect()
        };
        for controller in controllers {
            controller.shutdown().await;
        }
        if let Some(bus) = &self.bus {
            let _ = bus.flush().await;
            let _ = bus.close().await;
        }
        info!("process context shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_initialize_with_memory_bus() {
        let opts = ContextOptions {
            defaults: obj(json!({ "bus": { "host": "ignored", "port": 4222 } })),
            ..Default::default()
        };
        let context = ProcessContext::initialize(opts, memory_connector())
            .await
            .unwrap();
        assert!(context.bus().is_some());
        context.shutdown().await;
    }

    #[tokio::test]
    async fn test_required_bus_failure_aborts_bootstrap() {
        let opts = ContextOptions::default();
        let result = ProcessContext::initialize_with_bus(opts, None).await;
        assert!(matches!(result, Err(TcsError::Bus(_))));
    }

    #[tokio::test]
    async fn test_optional_bus_failure_degrades() {
        let opts = ContextOptions {
            defaults: obj(json!({ "bus": { "required": false } })),
            ..Default::default()
        };
        let context = ProcessContext::initialize_with_bus(opts, None).await.unwrap();
        assert!(context.bus().is_none());
        context.shutdown().await;
    }

    #[tokio::test]
    async fn test_bus_config_layer_is_applied() {
        let bus = MemoryBus::new();
        bus.serve(
            subjects::CONFIG_REQUEST,
            Arc::new(|_msg| Box::pin(async { json!({ "observatory": "oca" }) })),
        )
        .await
        .unwrap();

        let context = ProcessContext::initialize_with_bus(
            ContextOptions::default(),
            Some(Arc::new(bus) as Arc<dyn Bus>),
        )
        .await
        .unwrap();
        assert_eq!(context.config().get("observatory"), Some(json!("oca")));
        context.shutdown().await;
    }

    #[test]
    fn test_endpoint_resolution_prefers_env() {
        let config = ConfigResolver::new();
        config.push_defaults(obj(json!({ "bus": { "host": "filehost", "port": 4333 } })));

        let endpoint = ProcessContext::bus_endpoint(&config);
        assert_eq!(endpoint.host, "filehost");
        assert_eq!(endpoint.port, 4333);
        assert!(endpoint.required);

        std::env::set_var("BUS_HOST", "envhost");
        std::env::set_var("BUS_PORT", "4555");
        let endpoint = ProcessContext::bus_endpoint(&config);
        assert_eq!(endpoint.host, "envhost");
        assert_eq!(endpoint.port, 4555);
        std::env::remove_var("BUS_HOST");
        std::env::remove_var("BUS_PORT");
    }
}
