//! Bus-attached monitor
//!
//! [`BusMonitor`] binds a [`Monitor`] tree to a bus handle and publishes
//! the three event classes of the protocol:
//!
//! - registry events on `svc.registry.<event>.<service_id>` (lifecycle)
//! - status reports on `svc.status.<service_id>` whenever the effective
//!   status of the tree changes
//! - heartbeats on `svc.heartbeat.<service_id>` on a fixed period, with a
//!   monotonic sequence and the time the next beat is due
//!
//! It also serves the versioned RPC surface
//! `svc.rpc.<service_id>.v1.<command>` with the mandatory `health` and
//! `stats` commands; components may register additional commands.
//!
//! Publishing is best-effort: a publish error is logged and swallowed, and
//! a monitor constructed without a bus degrades to a local no-op so the
//! owning component keeps working identically.

use crate::monitor::Monitor;
use bus::{subjects, Bus, RpcHandler};
use futures::future::BoxFuture;
use schema::{HeartbeatPayload, RegistryEvent, StatusPayload, Utc7};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default heartbeat period
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Default healthcheck period
pub const DEFAULT_HEALTHCHECK_PERIOD: Duration = Duration::from_secs(30);

/// Identity context a bus monitor publishes under
#[derive(Debug, Clone)]
pub struct MonitorContext {
    /// Identity on the bus (`{service_type}.{variant}`)
    pub service_id: String,
    /// Service type
    pub service_type: String,
    /// Instance variant
    pub variant: String,
    /// Launcher owning the instance, if any
    pub launcher_id: Option<String>,
    /// Runner supervising the instance, if any
    pub runner_id: Option<String>,
    /// Display-only parent name
    pub parent_name: Option<String>,
    /// Host the process runs on
    pub host: String,
    /// OS process id
    pub pid: u32,
}

impl MonitorContext {
    /// Build a context for a service instance on this host/process
    #[must_use]
    pub fn new(service_type: &str, variant: &str) -> Self {
        Self {
            service_id: format!("{service_type}.{variant}"),
            service_type: service_type.to_string(),
            variant: variant.to_string(),
            launcher_id: None,
            runner_id: None,
            parent_name: None,
            host: local_hostname(),
            pid: std::process::id(),
        }
    }

    /// Attach the supervising runner id
    #[must_use]
    pub fn with_runner_id(mut self, runner_id: Option<String>) -> Self {
        self.runner_id = runner_id;
        self
    }

    /// Attach the owning launcher id
    #[must_use]
    pub fn with_launcher_id(mut self, launcher_id: Option<String>) -> Self {
        self.launcher_id = launcher_id;
        self
    }

    /// Attach the display-only parent name
    #[must_use]
    pub fn with_parent_name(mut self, parent_name: Option<String>) -> Self {
        self.parent_name = parent_name;
        self
    }
}

/// Short hostname of this machine
#[must_use]
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.split('.').next().unwrap_or(&h).to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Extension RPC command: receives the command remainder and the request
/// payload, returns the response payload
pub type RpcCommand = Arc<dyn Fn(String, Value) -> BoxFuture<'static, Value> + Send + Sync>;

/// Monitor bound to a bus handle and an identity context
pub struct BusMonitor {
    monitor: Monitor,
    bus: Option<Arc<dyn Bus>>,
    ctx: MonitorContext,
    heartbeat_period: Duration,
    healthcheck_period: Duration,
    sequence: AtomicU64,
    started: Mutex<Option<Instant>>,
    commands: Mutex<HashMap<String, RpcCommand>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl BusMonitor {
    /// Bind `monitor` to `bus` under the given identity
    ///
    /// Passing `None` for the bus yields a fully functional local monitor
    /// whose publish operations succeed silently.
    #[must_use]
    pub fn new(monitor: Monitor, bus: Option<Arc<dyn Bus>>, ctx: MonitorContext) -> Arc<Self> {
        Self::with_periods(
            monitor,
            bus,
            ctx,
            DEFAULT_HEARTBEAT_PERIOD,
            DEFAULT_HEALTHCHECK_PERIOD,
        )
    }

    /// Bind with explicit heartbeat/healthcheck periods
    #[must_use]
    pub fn with_periods(
        monitor: Monitor,
        bus: Option<Arc<dyn Bus>>,
        ctx: MonitorContext,
        heartbeat_period: Duration,
        healthcheck_period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            monitor,
            bus,
            ctx,
            heartbeat_period,
            healthcheck_period,
            sequence: AtomicU64::new(0),
            started: Mutex::new(None),
            commands: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// The wrapped monitor tree
    #[must_use]
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Identity context
    #[must_use]
    pub fn context(&self) -> &MonitorContext {
        &self.ctx
    }

    /// Seconds since monitoring started
    #[must_use]
    pub fn uptime_sec(&self) -> f64 {
        self.started
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Register an additional RPC command under the `v1` namespace
    ///
    /// `name` matches either the whole command or a `name.` prefix; the
    /// remainder after the prefix is passed to the handler.
    pub fn add_rpc_command(&self, name: &str, handler: RpcCommand) {
        self.commands
            .lock()
            .unwrap()
            .insert(name.to_string(), handler);
    }

    /// Start the publishing loops and the RPC responder
    ///
    /// Resets the heartbeat sequence; observers treat a reset as a new
    /// service incarnation.
    pub async fn start(self: &Arc<Self>) {
        self.sequence.store(0, Ordering::SeqCst);
        *self.started.lock().unwrap() = Some(Instant::now());

        let (tx, mut change_rx) = mpsc::unbounded_channel();
        self.monitor.install_notifier(tx);

        {
            let mut tasks = self.tasks.lock().unwrap();

            // Status publisher: one publish per change notification
            let this = Arc::clone(self);
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = change_rx.recv() => match changed {
                            Some(()) => this.publish_status().await,
                            None => break,
                        },
                    }
                }
            }));

            // Heartbeat loop
            let this = Arc::clone(self);
            let cancel = self.cancel.clone();
            let period = self.heartbeat_period;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => this.publish_heartbeat().await,
                    }
                }
            }));

            // Healthcheck loop
            let this = Arc::clone(self);
            let cancel = self.cancel.clone();
            let period = self.healthcheck_period;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                // The first tick fires immediately; skip it so a fresh monitor
                // is not re-evaluated before the service finished starting.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => this.monitor.run_healthchecks(),
                    }
                }
            }));
        }

        self.serve_rpc().await;
        info!(
            service_id = %self.ctx.service_id,
            heartbeat_sec = self.heartbeat_period.as_secs_f64(),
            healthcheck_sec = self.healthcheck_period.as_secs_f64(),
            "monitoring started"
        );
    }

    /// Stop the loops and flush outstanding publishes
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Some(bus) = &self.bus {
            let _ = bus.flush().await;
        }
        info!(service_id = %self.ctx.service_id, "monitoring stopped");
    }

    /// Publish a registry event; best-effort
    pub async fn publish_registry(&self, event: RegistryEvent) {
        let subject = subjects::registry(event.kind(), event.service_id());
        match serde_json::to_value(&event) {
            Ok(payload) => self.publish(&subject, &payload).await,
            Err(e) => warn!(subject, "failed to encode registry event: {e}"),
        }
    }

    /// Publish the current status report; best-effort
    pub async fn publish_status(&self) {
        let snap = self.monitor.snapshot();
        let payload = StatusPayload {
            name: self.ctx.service_id.clone(),
            status: snap.status,
            message: snap.message,
            timestamp: snap.timestamp,
            own_status: (!snap.children.is_empty()).then_some(snap.own_status),
            children: snap.children,
            metrics: snap.metrics,
        };
        let subject = subjects::status(&self.ctx.service_id);
        match serde_json::to_value(&payload) {
            Ok(value) => self.publish(&subject, &value).await,
            Err(e) => warn!(subject, "failed to encode status report: {e}"),
        }
    }

    /// Publish one heartbeat; best-effort
    pub async fn publish_heartbeat(&self) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let now = chrono::Utc::now();
        let next = now + chrono::Duration::from_std(self.heartbeat_period).unwrap_or_default();
        let payload = HeartbeatPayload {
            service_id: self.ctx.service_id.clone(),
            sequence,
            uptime_sec: self.uptime_sec(),
            status: self.monitor.effective_status(),
            timestamp: Utc7::from_datetime(now),
            next_heartbeat_expected: Utc7::from_datetime(next),
            metrics: self.monitor.collect_metrics(),
        };
        let subject = subjects::heartbeat(&self.ctx.service_id);
        match serde_json::to_value(&payload) {
            Ok(value) => self.publish(&subject, &value).await,
            Err(e) => warn!(subject, "failed to encode heartbeat: {e}"),
        }
    }

    async fn publish(&self, subject: &str, payload: &Value) {
        let Some(bus) = &self.bus else {
            debug!(subject, "no bus attached, dropping publication");
            return;
        };
        if let Err(e) = bus.publish(subject, payload).await {
            // Publishing must never fail the caller.
            warn!(subject, "publish failed: {e}");
        }
    }

    async fn serve_rpc(self: &Arc<Self>) {
        let Some(bus) = &self.bus else {
            return;
        };
        let weak = Arc::downgrade(self);
        let handler: RpcHandler = Arc::new(move |msg| {
            let weak: Weak<BusMonitor> = Weak::clone(&weak);
            Box::pin(async move {
                let Some(this) = weak.upgrade() else {
                    return json!({ "error": "monitor is gone" });
                };
                let Some(command) = subjects::rpc_command(&msg.subject) else {
                    return json!({ "error": "malformed rpc subject" });
                };
                this.dispatch_rpc(command, msg.payload).await
            })
        });
        if let Err(e) = bus
            .serve(&subjects::rpc_all(&self.ctx.service_id), handler)
            .await
        {
            warn!(service_id = %self.ctx.service_id, "failed to serve rpc: {e}");
        }
    }

    async fn dispatch_rpc(&self, command: &str, payload: Value) -> Value {
        match command {
            "health" => self.health_payload(),
            "stats" => self.stats_payload(),
            other => {
                let registered = {
                    let commands = self.commands.lock().unwrap();
                    commands
                        .iter()
                        .find_map(|(name, handler)| {
                            if other == name {
                                Some((Arc::clone(handler), String::new()))
                            } else {
                                other
                                    .strip_prefix(&format!("{name}."))
                                    .map(|rest| (Arc::clone(handler), rest.to_string()))
                            }
                        })
                };
                match registered {
                    Some((handler, rest)) => handler(rest, payload).await,
                    None => json!({ "error": format!("unknown command '{other}'") }),
                }
            }
        }
    }

    /// `health` command: effective status plus the individual check opinions
    fn health_payload(&self) -> Value {
        let snap = self.monitor.snapshot();
        let checks = self.monitor.healthcheck_opinions();
        json!({
            "service_id": self.ctx.service_id,
            "status": snap.status,
            "own_status": snap.own_status,
            "message": snap.message,
            "children": snap.children,
            "checks": checks,
        })
    }

    /// `stats` command: extended, possibly expensive metrics
    fn stats_payload(&self) -> Value {
        let snap = self.monitor.snapshot();
        json!({
            "service_id": self.ctx.service_id,
            "status": snap.status,
            "uptime_sec": self.uptime_sec(),
            "heartbeat_sequence": self.sequence.load(Ordering::SeqCst),
            "host": self.ctx.host,
            "pid": self.ctx.pid,
            "runner_id": self.ctx.runner_id,
            "launcher_id": self.ctx.launcher_id,
            "metrics": snap.metrics,
            "children": snap.children,
        })
    }
}

impl Drop for BusMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus::MemoryBus;
    use schema::{ExitClass, Status};

    fn test_bus() -> Arc<dyn Bus> {
        Arc::new(MemoryBus::new())
    }

    fn quick_monitor(bus: Option<Arc<dyn Bus>>) -> Arc<BusMonitor> {
        let monitor = Monitor::new("echo.t1");
        BusMonitor::with_periods(
            monitor,
            bus,
            MonitorContext::new("echo", "t1"),
            Duration::from_millis(50),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_status_published_on_change() {
        let bus = test_bus();
        let mut sub = bus.subscribe(bus::subjects::STATUS_ALL).await.unwrap();
        let bm = quick_monitor(Some(Arc::clone(&bus)));
        bm.start().await;

        bm.monitor().set_status(Status::Ok, "Service running");
        let msg = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("status not published")
            .unwrap();
        assert_eq!(msg.subject, "svc.status.echo.t1");
        let payload: StatusPayload = serde_json::from_value(msg.payload).unwrap();
        assert_eq!(payload.status, Status::Ok);
        assert_eq!(payload.name, "echo.t1");
        bm.stop().await;
    }

    #[tokio::test]
    async fn test_child_change_triggers_publish() {
        let bus = test_bus();
        let mut sub = bus.subscribe(bus::subjects::STATUS_ALL).await.unwrap();
        let bm = quick_monitor(Some(Arc::clone(&bus)));
        bm.monitor().set_status(Status::Ok, "fine");
        bm.start().await;

        let child = Monitor::new("conn");
        bm.monitor().add_child(child.clone());
        child.set_status(Status::Warning, "flaky");

        let mut saw_warning = false;
        for _ in 0..5 {
            let Ok(Some(msg)) =
                tokio::time::timeout(Duration::from_secs(1), sub.next()).await
            else {
                break;
            };
            let payload: StatusPayload = serde_json::from_value(msg.payload).unwrap();
            if payload.status == Status::Warning {
                assert_eq!(payload.own_status, Some(Status::Ok));
                assert_eq!(payload.children.len(), 1);
                assert_eq!(payload.children[0].name, "conn");
                saw_warning = true;
                break;
            }
        }
        assert!(saw_warning, "aggregated warning status was never published");
        bm.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_sequence_is_monotonic() {
        let bus = test_bus();
        let mut sub = bus.subscribe(bus::subjects::HEARTBEAT_ALL).await.unwrap();
        let bm = quick_monitor(Some(Arc::clone(&bus)));
        bm.start().await;

        let mut last = 0u64;
        for _ in 0..3 {
            let msg = tokio::time::timeout(Duration::from_secs(1), sub.next())
                .await
                .expect("heartbeat not published")
                .unwrap();
            let hb: HeartbeatPayload = serde_json::from_value(msg.payload).unwrap();
            assert!(hb.sequence > last, "sequence must increase strictly");
            assert!(hb.next_heartbeat_expected > hb.timestamp);
            last = hb.sequence;
        }
        bm.stop().await;
    }

    #[tokio::test]
    async fn test_registry_event_lands_on_event_subject() {
        let bus = test_bus();
        let bm = quick_monitor(Some(Arc::clone(&bus)));
        bm.publish_registry(RegistryEvent::ready("echo.t1")).await;
        bm.publish_registry(RegistryEvent::stop("echo.t1", 1.0, ExitClass::Clean, Some(0)))
            .await;

        let history = bus.history("svc.registry.>").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].subject, "svc.registry.ready.echo.t1");
        assert_eq!(history[1].subject, "svc.registry.stop.echo.t1");
    }

    #[tokio::test]
    async fn test_detached_monitor_is_a_noop() {
        let bm = quick_monitor(None);
        bm.start().await;
        bm.monitor().set_status(Status::Ok, "fine");
        bm.publish_registry(RegistryEvent::ready("echo.t1")).await;
        bm.publish_status().await;
        bm.publish_heartbeat().await;
        bm.stop().await;
    }

    #[tokio::test]
    async fn test_health_and_stats_rpc() {
        let bus = test_bus();
        let bm = quick_monitor(Some(Arc::clone(&bus)));
        bm.monitor().set_status(Status::Ok, "fine");
        bm.monitor().add_healthcheck_cb(|| None);
        bm.start().await;

        let health = bus
            .request(
                &bus::subjects::rpc("echo.t1", "health"),
                &json!({}),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(health["service_id"], "echo.t1");
        assert_eq!(health["status"], "ok");
        assert_eq!(health["checks"], json!([null]));

        let stats = bus
            .request(
                &bus::subjects::rpc("echo.t1", "stats"),
                &json!({}),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(stats["service_id"], "echo.t1");
        assert!(stats["pid"].as_u64().unwrap() > 0);
        bm.stop().await;
    }

    #[tokio::test]
    async fn test_extension_rpc_command() {
        let bus = test_bus();
        let bm = quick_monitor(Some(Arc::clone(&bus)));
        bm.add_rpc_command(
            "start",
            Arc::new(|rest, _payload| {
                Box::pin(async move { json!({ "started": rest }) })
            }),
        );
        bm.start().await;

        let reply = bus
            .request(
                &bus::subjects::rpc("echo.t1", "start.echo.t2"),
                &json!({}),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply["started"], "echo.t2");

        let unknown = bus
            .request(
                &bus::subjects::rpc("echo.t1", "bogus"),
                &json!({}),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(unknown["error"].as_str().unwrap().contains("bogus"));
        bm.stop().await;
    }
}
