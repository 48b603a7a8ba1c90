//! Per-instance service controller
//!
//! A [`ServiceController`] drives one service instance through its
//! lifecycle, in the same process as the service:
//!
//! ```text
//! Uninitialized --initialize--> Initialized | Failed
//! Initialized   --start-------> Starting
//! Starting      --ok----------> Running        (publish ready)
//! Starting      --error-------> Failed         (publish failed)
//! Running       --stop--------> Stopping
//! Running       --service_exit-> Stopped|Failed (publish stop)
//! Stopping      --ok----------> Stopped
//! Stopping      --error-------> Failed
//! ```
//!
//! Error mapping: initialization and startup errors set status `Failed`;
//! an error inside the running service sets `Error` and surfaces to the
//! supervisor through the terminal `Failed` state; a stop-hook error sets
//! `Error` but the registry `stop` event is still published, classified
//! `failed`. A controller whose initialization fails stays addressable and
//! publishes `Failed` so observers see the instance.

use crate::config::{ConfigResolver, ResolvedConfig};
use crate::error::{Result, TcsError};
use crate::monitor::{BusMonitor, Monitor, MonitorContext};
use crate::service::{ServiceContext, ServiceInstance, ServiceRegistry};
use bus::Bus;
use schema::{ExitClass, RegistryEvent, ServiceDescriptor, Status, Utc7};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Grace window for a service to finish its stop path
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Lifecycle states of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Created, nothing resolved yet
    Uninitialized,
    /// Classes and configuration resolved, monitor attached
    Initialized,
    /// Start hook in progress
    Starting,
    /// Service is up
    Running,
    /// Stop in progress
    Stopping,
    /// Terminal: stopped cleanly
    Stopped,
    /// Terminal: failed
    Failed,
}

impl ControllerState {
    /// Whether the state is terminal
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerState::Stopped | ControllerState::Failed)
    }
}

/// What a service driver reports when it finishes
struct ExitReport {
    error: Option<String>,
}

enum RunningService {
    Permanent(Box<dyn crate::service::PermanentService>),
    Driven {
        cancel: CancellationToken,
        driver: JoinHandle<()>,
    },
}

/// Everything a controller needs from its process
pub struct ControllerDeps {
    /// Descriptor of the instance
    pub descriptor: ServiceDescriptor,
    /// Shared configuration resolver
    pub resolver: Arc<ConfigResolver>,
    /// In-process service registry
    pub registry: Arc<ServiceRegistry>,
    /// Shared bus handle, if any
    pub bus: Option<Arc<dyn Bus>>,
    /// Supervising runner id
    pub runner_id: Option<String>,
    /// Owning launcher id
    pub launcher_id: Option<String>,
    /// Display-only parent name
    pub parent_name: Option<String>,
    /// Stop grace window
    pub stop_grace: Duration,
}

impl ControllerDeps {
    /// Deps with default grace and no supervisor attribution
    #[must_use]
    pub fn new(
        descriptor: ServiceDescriptor,
        resolver: Arc<ConfigResolver>,
        registry: Arc<ServiceRegistry>,
        bus: Option<Arc<dyn Bus>>,
    ) -> Self {
        Self {
            descriptor,
            resolver,
            registry,
            bus,
            runner_id: None,
            launcher_id: None,
            parent_name: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Controller of one service instance
pub struct ServiceController {
    descriptor: ServiceDescriptor,
    service_id: String,
    resolver: Arc<ConfigResolver>,
    registry: Arc<ServiceRegistry>,
    bus: Option<Arc<dyn Bus>>,
    runner_id: Option<String>,
    launcher_id: Option<String>,
    parent_name: Option<String>,
    stop_grace: Duration,
    monitor: Monitor,
    bus_monitor: Mutex<Option<Arc<BusMonitor>>>,
    state_tx: watch::Sender<ControllerState>,
    pending: AsyncMutex<Option<ServiceInstance>>,
    running: AsyncMutex<Option<RunningService>>,
    service_config: Mutex<Option<ResolvedConfig>>,
    started_at: Mutex<Option<Instant>>,
}

impl ServiceController {
    /// Create a controller for one instance
    #[must_use]
    pub fn new(deps: ControllerDeps) -> Arc<Self> {
        let service_id = deps.descriptor.service_id();
        let (state_tx, _) = watch::channel(ControllerState::Uninitialized);
        info!(service_id, "controller created");
        Arc::new(Self {
            monitor: Monitor::with_parent_name(service_id.clone(), deps.parent_name.clone()),
            service_id,
            descriptor: deps.descriptor,
            resolver: deps.resolver,
            registry: deps.registry,
            bus: deps.bus,
            runner_id: deps.runner_id,
            launcher_id: deps.launcher_id,
            parent_name: deps.parent_name,
            stop_grace: deps.stop_grace,
            bus_monitor: Mutex::new(None),
            state_tx,
            pending: AsyncMutex::new(None),
            running: AsyncMutex::new(None),
            service_config: Mutex::new(None),
            started_at: Mutex::new(None),
        })
    }

    /// Service identity
    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Descriptor the controller was created from
    #[must_use]
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// The instance's monitor
    #[must_use]
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ControllerState) {
        debug!(service_id = %self.service_id, ?state, "state transition");
        self.state_tx.send_replace(state);
    }

    async fn publish_registry(&self, event: RegistryEvent) {
        let bm = self.bus_monitor.lock().unwrap().clone();
        if let Some(bm) = bm {
            bm.publish_registry(event).await;
        }
    }

    fn uptime_sec(&self) -> f64 {
        self.started_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Resolve the service class and configuration, attach the monitor to
    /// the bus, and emit the `start` registry event
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            ControllerState::Uninitialized => {}
            ControllerState::Initialized => return Ok(()),
            other => {
                return Err(TcsError::Other(format!(
                    "cannot initialize controller in state {other:?}"
                )))
            }
        }

        // The monitor attaches first so even a failed initialization is
        // observable on the bus.
        let ctx = MonitorContext::new(&self.descriptor.service_type, &self.descriptor.variant)
            .with_runner_id(self.runner_id.clone())
            .with_launcher_id(self.launcher_id.clone())
            .with_parent_name(self.parent_name.clone());
        let host = ctx.host.clone();
        let pid = ctx.pid;
        let bm = BusMonitor::new(self.monitor.clone(), self.bus.clone(), ctx);
        bm.start().await;
        *self.bus_monitor.lock().unwrap() = Some(Arc::clone(&bm));

        self.publish_registry(RegistryEvent::Start {
            service_id: self.service_id.clone(),
            runner_id: self.runner_id.clone(),
            launcher_id: self.launcher_id.clone(),
            host,
            pid,
            timestamp: Utc7::now(),
        })
        .await;
        self.monitor
            .set_status(Status::Startup, "Initializing controller");

        let (instance, schema) = match self.registry.create(&self.descriptor.service_type) {
            Some(found) => found,
            None => {
                let msg = format!(
                    "service type '{}' is not registered",
                    self.descriptor.service_type
                );
                return self.fail_initialize("discovery", msg).await;
            }
        };

        let raw = self
            .resolver
            .resolve_instance(&self.descriptor.service_type, &self.descriptor.variant);
        let config = match schema.apply(raw) {
            Ok(config) => config,
            Err(e) => {
                return self.fail_initialize("config", e.to_string()).await;
            }
        };

        *self.pending.lock().await = Some(instance);
        *self.service_config.lock().unwrap() = Some(config);
        self.set_state(ControllerState::Initialized);
        info!(service_id = %self.service_id, "controller initialized");
        Ok(())
    }

    async fn fail_initialize(&self, reason: &str, msg: String) -> Result<()> {
        error!(service_id = %self.service_id, "initialization failed: {msg}");
        self.monitor.set_status(Status::Failed, &msg);
        self.publish_registry(RegistryEvent::failed(
            self.service_id.clone(),
            reason,
            Some(msg.clone()),
        ))
        .await;
        self.set_state(ControllerState::Failed);
        match reason {
            "config" => Err(TcsError::Config(msg)),
            _ => Err(TcsError::Discovery(msg)),
        }
    }

    fn service_context(&self) -> ServiceContext {
        ServiceContext {
            service_id: self.service_id.clone(),
            monitor: self.monitor.clone(),
            config: self
                .service_config
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_default(),
        }
    }

    /// Invoke the service's start path; `ready` on success
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            ControllerState::Initialized => {}
            ControllerState::Running => {
                warn!(service_id = %self.service_id, "service already running");
                return Ok(());
            }
            other => {
                return Err(TcsError::Startup(format!(
                    "cannot start from state {other:?}"
                )))
            }
        }

        self.set_state(ControllerState::Starting);
        self.monitor.set_status(Status::Startup, "Starting service");

        let instance = match self.pending.lock().await.take() {
            Some(instance) => instance,
            None => match self.registry.create(&self.descriptor.service_type) {
                Some((instance, _)) => instance,
                None => {
                    return self
                        .fail_start(format!(
                            "service type '{}' disappeared from the registry",
                            self.descriptor.service_type
                        ))
                        .await
                }
            },
        };
        let ctx = self.service_context();

        match instance {
            ServiceInstance::Permanent(mut svc) => {
                if let Err(e) = svc.start(&ctx).await {
                    return self.fail_start(e.to_string()).await;
                }
                *self.running.lock().await = Some(RunningService::Permanent(svc));
            }
            ServiceInstance::Blocking(mut svc) => {
                let cancel = CancellationToken::new();
                let (started_tx, started_rx) = oneshot::channel();
                let (exit_tx, exit_rx) = oneshot::channel();
                let driver_ctx = ctx.clone();
                let driver_cancel = cancel.clone();
                let monitor = self.monitor.clone();
                let driver = tokio::spawn(async move {
                    if let Err(e) = svc.on_start(&driver_ctx).await {
                        let _ = started_tx.send(Err(e));
                        return;
                    }
                    let _ = started_tx.send(Ok(()));

                    let mut error = None;
                    tokio::select! {
                        result = svc.run(&driver_ctx) => {
                            if let Err(e) = result {
                                monitor.set_status(Status::Error, &format!("Error in run: {e}"));
                                error = Some(e.to_string());
                            }
                        }
                        _ = driver_cancel.cancelled() => {}
                    }
                    if let Err(e) = svc.on_stop(&driver_ctx).await {
                        monitor.set_status(Status::Error, &format!("Error in stop hook: {e}"));
                        if error.is_none() {
                            error = Some(e.to_string());
                        }
                    }
                    let _ = exit_tx.send(ExitReport { error });
                });

                match started_rx.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return self.fail_start(e.to_string()).await,
                    Err(_) => {
                        return self.fail_start("service start hook panicked".to_string()).await
                    }
                }
                *self.running.lock().await = Some(RunningService::Driven { cancel, driver });
                self.watch_exit(exit_rx);
            }
            ServiceInstance::SingleShot(mut svc) => {
                let cancel = CancellationToken::new();
                let (exit_tx, exit_rx) = oneshot::channel();
                let driver_ctx = ctx.clone();
                let driver_cancel = cancel.clone();
                let monitor = self.monitor.clone();
                let driver = tokio::spawn(async move {
                    let mut error = None;
                    tokio::select! {
                        result = svc.execute(&driver_ctx) => {
                            if let Err(e) = result {
                                monitor.set_status(Status::Error, &format!("Error in execute: {e}"));
                                error = Some(e.to_string());
                            }
                        }
                        _ = driver_cancel.cancelled() => {}
                    }
                    let _ = exit_tx.send(ExitReport { error });
                });
                *self.running.lock().await = Some(RunningService::Driven { cancel, driver });
                self.watch_exit(exit_rx);
            }
        }

        *self.started_at.lock().unwrap() = Some(Instant::now());
        self.set_state(ControllerState::Running);
        self.monitor.set_status(Status::Ok, "Service running");
        self.publish_registry(RegistryEvent::ready(self.service_id.clone()))
            .await;
        info!(service_id = %self.service_id, "service started");
        Ok(())
    }

    async fn fail_start(&self, msg: String) -> Result<()> {
        error!(service_id = %self.service_id, "start failed: {msg}");
        self.monitor.set_status(Status::Failed, &msg);
        self.publish_registry(RegistryEvent::failed(
            self.service_id.clone(),
            "startup",
            Some(msg.clone()),
        ))
        .await;
        self.set_state(ControllerState::Failed);
        Err(TcsError::Startup(msg))
    }

    /// Watch for the driver finishing and classify the exit
    fn watch_exit(self: &Arc<Self>, exit_rx: oneshot::Receiver<ExitReport>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let report = match exit_rx.await {
                Ok(report) => report,
                Err(_) => ExitReport {
                    error: Some("service driver panicked".to_string()),
                },
            };
            this.handle_exit(report).await;
        });
    }

    async fn handle_exit(&self, report: ExitReport) {
        // An instantly-exiting service may finish while start() is still
        // publishing `ready`; wait so the registry order start → ready →
        // stop holds.
        let mut state_rx = self.subscribe_state();
        while matches!(
            *state_rx.borrow_and_update(),
            ControllerState::Starting | ControllerState::Initialized
        ) {
            if state_rx.changed().await.is_err() {
                break;
            }
        }

        let stopping = self.state() == ControllerState::Stopping;
        if self.state().is_terminal() {
            return;
        }
        let uptime = self.uptime_sec();
        match report.error {
            None => {
                if !stopping {
                    info!(service_id = %self.service_id, "service completed");
                }
                self.monitor.set_status(Status::Ok, "Service stopped");
                self.publish_registry(RegistryEvent::stop(
                    self.service_id.clone(),
                    uptime,
                    ExitClass::Clean,
                    None,
                ))
                .await;
                self.set_state(ControllerState::Stopped);
            }
            Some(msg) => {
                // Runtime and shutdown errors keep status Error (set by the
                // driver); the stop event is still published, classified
                // failed.
                warn!(service_id = %self.service_id, "service exited with error: {msg}");
                self.publish_registry(RegistryEvent::stop(
                    self.service_id.clone(),
                    uptime,
                    ExitClass::Failed,
                    None,
                ))
                .await;
                self.set_state(ControllerState::Failed);
            }
        }
    }

    /// Stop the service: `stopping` event, stop hook, `stop` event
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            ControllerState::Running => {}
            ControllerState::Stopped | ControllerState::Failed => return Ok(()),
            other => {
                return Err(TcsError::Shutdown(format!(
                    "cannot stop from state {other:?}"
                )))
            }
        }

        self.publish_registry(RegistryEvent::stopping(self.service_id.clone()))
            .await;
        self.set_state(ControllerState::Stopping);
        self.monitor.set_status(Status::Shutdown, "Stopping service");

        let running = self.running.lock().await.take();
        match running {
            Some(RunningService::Permanent(mut svc)) => {
                let ctx = self.service_context();
                let uptime = self.uptime_sec();
                match tokio::time::timeout(self.stop_grace, svc.stop(&ctx)).await {
                    Ok(Ok(())) => {
                        self.monitor.set_status(Status::Ok, "Service stopped");
                        self.publish_registry(RegistryEvent::stop(
                            self.service_id.clone(),
                            uptime,
                            ExitClass::Clean,
                            None,
                        ))
                        .await;
                        self.set_state(ControllerState::Stopped);
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        self.monitor
                            .set_status(Status::Error, &format!("Error in stop hook: {e}"));
                        self.publish_registry(RegistryEvent::stop(
                            self.service_id.clone(),
                            uptime,
                            ExitClass::Failed,
                            None,
                        ))
                        .await;
                        self.set_state(ControllerState::Failed);
                        Err(TcsError::Shutdown(e.to_string()))
                    }
                    Err(_) => {
                        let msg = format!("stop hook exceeded {:?}", self.stop_grace);
                        self.monitor.set_status(Status::Error, &msg);
                        self.publish_registry(RegistryEvent::stop(
                            self.service_id.clone(),
                            uptime,
                            ExitClass::Failed,
                            None,
                        ))
                        .await;
                        self.set_state(ControllerState::Failed);
                        Err(TcsError::Shutdown(msg))
                    }
                }
            }
            Some(RunningService::Driven { cancel, driver }) => {
                cancel.cancel();
                let mut state_rx = self.subscribe_state();
                let wait = async {
                    loop {
                        if state_rx.borrow_and_update().is_terminal() {
                            break;
                        }
                        if state_rx.changed().await.is_err() {
                            break;
                        }
                    }
                };
                if tokio::time::timeout(self.stop_grace, wait).await.is_err() {
                    // The driver did not unwind within the grace window;
                    // abandon it and mark the instance failed.
                    driver.abort();
                    let msg = format!("service did not stop within {:?}", self.stop_grace);
                    error!(service_id = %self.service_id, "{msg}");
                    self.monitor.set_status(Status::Error, &msg);
                    self.publish_registry(RegistryEvent::stop(
                        self.service_id.clone(),
                        self.uptime_sec(),
                        ExitClass::Failed,
                        None,
                    ))
                    .await;
                    self.set_state(ControllerState::Failed);
                    return Err(TcsError::Shutdown(msg));
                }
                match self.state() {
                    ControllerState::Stopped => Ok(()),
                    _ => Err(TcsError::Shutdown("service stop failed".to_string())),
                }
            }
            None => {
                // Driver already reported the exit concurrently.
                Ok(())
            }
        }
    }

    /// Stop monitoring and release the instance
    pub async fn shutdown(self: &Arc<Self>) {
        if self.state() == ControllerState::Running {
            let _ = self.stop().await;
        }
        let bm = self.bus_monitor.lock().unwrap().take();
        if let Some(bm) = bm {
            bm.stop().await;
        }
        debug!(service_id = %self.service_id, "controller shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{BlockingService, ServiceContext, SingleShotService};
    use async_trait::async_trait;
    use bus::MemoryBus;
    use schema::StatusPayload;

    struct Ticker;

    #[async_trait]
    impl BlockingService for Ticker {
        async fn run(&mut self, ctx: &ServiceContext) -> Result<()> {
            loop {
                let _guard = ctx.monitor.track_task();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    struct FailsToStart;

    #[async_trait]
    impl BlockingService for FailsToStart {
        async fn on_start(&mut self, _ctx: &ServiceContext) -> Result<()> {
            Err(TcsError::Startup("boom".to_string()))
        }
        async fn run(&mut self, _ctx: &ServiceContext) -> Result<()> {
            Ok(())
        }
    }

    struct CrashesAfter {
        delay: Duration,
    }

    #[async_trait]
    impl BlockingService for CrashesAfter {
        async fn run(&mut self, _ctx: &ServiceContext) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            Err(TcsError::Runtime("loop fell over".to_string()))
        }
    }

    struct OneShot;

    #[async_trait]
    impl SingleShotService for OneShot {
        async fn execute(&mut self, _ctx: &ServiceContext) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> Arc<ServiceRegistry> {
        let registry = ServiceRegistry::new();
        registry.register("ticker", || ServiceInstance::Blocking(Box::new(Ticker)));
        registry.register("failstart", || {
            ServiceInstance::Blocking(Box::new(FailsToStart))
        });
        registry.register("crasher", || {
            ServiceInstance::Blocking(Box::new(CrashesAfter {
                delay: Duration::from_millis(20),
            }))
        });
        registry.register("oneshot", || ServiceInstance::SingleShot(Box::new(OneShot)));
        Arc::new(registry)
    }

    fn controller_for(service_type: &str, bus: Arc<dyn Bus>) -> Arc<ServiceController> {
        let descriptor = ServiceDescriptor::new(service_type, "t1");
        let deps = ControllerDeps::new(
            descriptor,
            Arc::new(ConfigResolver::new()),
            registry(),
            Some(bus),
        );
        ServiceController::new(deps)
    }

    async fn registry_kinds(bus: &Arc<dyn Bus>, service_id: &str) -> Vec<String> {
        bus.history(&format!("svc.registry.*.{service_id}"))
            .await
            .unwrap()
            .iter()
            .map(|m| m.payload["event"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_clean_lifecycle_event_order() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let ctrl = controller_for("ticker", Arc::clone(&bus));

        ctrl.initialize().await.unwrap();
        assert_eq!(ctrl.state(), ControllerState::Initialized);
        ctrl.start().await.unwrap();
        assert_eq!(ctrl.state(), ControllerState::Running);
        tokio::time::sleep(Duration::from_millis(30)).await;
        ctrl.stop().await.unwrap();
        assert_eq!(ctrl.state(), ControllerState::Stopped);
        ctrl.shutdown().await;

        let events = registry_kinds(&bus, "ticker.t1").await;
        assert_eq!(events, ["start", "ready", "stopping", "stop"]);
        let history = bus.history("svc.registry.stop.ticker.t1").await.unwrap();
        assert_eq!(history[0].payload["exit"], "clean");
    }

    #[tokio::test]
    async fn test_startup_failure_publishes_failed() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let ctrl = controller_for("failstart", Arc::clone(&bus));

        ctrl.initialize().await.unwrap();
        let err = ctrl.start().await.unwrap_err();
        assert!(matches!(err, TcsError::Startup(_)));
        assert_eq!(ctrl.state(), ControllerState::Failed);
        assert_eq!(ctrl.monitor().status(), Status::Failed);

        let events = registry_kinds(&bus, "failstart.t1").await;
        assert_eq!(events, ["start", "failed"]);
        let failed = bus.history("svc.registry.failed.failstart.t1").await.unwrap();
        assert!(failed[0].payload["message"]
            .as_str()
            .unwrap()
            .contains("boom"));

        // Status stream shows the instance as failed
        let statuses = bus.history("svc.status.failstart.t1").await.unwrap();
        let last: StatusPayload =
            serde_json::from_value(statuses.last().unwrap().payload.clone()).unwrap();
        assert_eq!(last.status, Status::Failed);
        ctrl.shutdown().await;
    }

    #[tokio::test]
    async fn test_runtime_error_surfaces_as_failed_exit() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let ctrl = controller_for("crasher", Arc::clone(&bus));

        ctrl.initialize().await.unwrap();
        ctrl.start().await.unwrap();

        let mut state_rx = ctrl.subscribe_state();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !state_rx.borrow_and_update().is_terminal() {
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(ctrl.state(), ControllerState::Failed);
        let stops = bus.history("svc.registry.stop.crasher.t1").await.unwrap();
        assert_eq!(stops[0].payload["exit"], "failed");
        ctrl.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_shot_reaches_terminal_state() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let ctrl = controller_for("oneshot", Arc::clone(&bus));

        ctrl.initialize().await.unwrap();
        ctrl.start().await.unwrap();

        let mut state_rx = ctrl.subscribe_state();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !state_rx.borrow_and_update().is_terminal() {
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(ctrl.state(), ControllerState::Stopped);
        let stops = bus.history("svc.registry.stop.oneshot.t1").await.unwrap();
        assert_eq!(stops[0].payload["exit"], "clean");
        ctrl.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_type_fails_initialization_but_stays_observable() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let ctrl = controller_for("nosuch", Arc::clone(&bus));

        let err = ctrl.initialize().await.unwrap_err();
        assert!(matches!(err, TcsError::Discovery(_)));
        assert_eq!(ctrl.state(), ControllerState::Failed);

        let events = registry_kinds(&bus, "nosuch.t1").await;
        assert_eq!(events, ["start", "failed"]);
        let statuses = bus.history("svc.status.nosuch.t1").await.unwrap();
        assert!(!statuses.is_empty());
        ctrl.shutdown().await;
    }
}
