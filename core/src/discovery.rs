//! Read-side discovery
//!
//! A [`DiscoveryClient`] reconstructs the current service table purely
//! from the bus streams: a warm start replays the persistent registry
//! history, live subscriptions keep the table current, and a periodic scan
//! marks zombies: instances still `Running` whose heartbeat lapsed past
//! `next_heartbeat_expected` plus one grace period. The zombie flag is
//! display-only; it never changes the projected stage.
//!
//! No central registry is consulted; any observer with bus access can
//! build the same table.

use bus::{subjects, Bus, Message};
use chrono::{DateTime, Utc};
use schema::{ChildStatus, HeartbeatPayload, RegistryEvent, Status, StatusPayload, Utc7};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Period of the zombie detector scan
const ZOMBIE_SCAN_PERIOD: Duration = Duration::from_secs(1);

/// Projected lifecycle stage of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStage {
    /// Declared by a launcher, not started yet
    Declared,
    /// Running (between `start` and `stopping`)
    Running,
    /// Graceful stop in progress
    Stopping,
    /// Stopped cleanly
    Stopped,
    /// Failed (startup failure, failed stop, or restart limit)
    Failed,
    /// Died abnormally
    Crashed,
    /// Supervisor is relaunching the instance
    Restarting,
}

/// Projected view of one service instance
#[derive(Debug, Clone)]
pub struct ServiceView {
    /// Service identity
    pub service_id: String,
    /// Projected lifecycle stage
    pub stage: ServiceStage,
    /// Latest published effective status
    pub status: Status,
    /// Latest status message
    pub message: Option<String>,
    /// Latest children summary
    pub children: Vec<ChildStatus>,
    /// Host from the latest `start` event
    pub host: Option<String>,
    /// Pid from the latest `start` event
    pub pid: Option<u32>,
    /// Supervising runner
    pub runner_id: Option<String>,
    /// Latest `start` time
    pub start_time: Option<Utc7>,
    /// Latest `stop` time
    pub stop_time: Option<Utc7>,
    /// Latest heartbeat time
    pub last_heartbeat: Option<Utc7>,
    /// Latest heartbeat sequence
    pub heartbeat_sequence: Option<u64>,
    /// When the next heartbeat was promised
    pub next_heartbeat_expected: Option<Utc7>,
    /// Heartbeat lapsed while the instance is `Running` (display-only)
    pub heartbeat_dead: bool,
    /// Seconds since `start`, for running instances
    pub uptime_sec: Option<f64>,
    zombie_deadline: Option<DateTime<Utc>>,
}

impl ServiceView {
    fn new(service_id: String) -> Self {
        Self {
            service_id,
            stage: ServiceStage::Declared,
            status: Status::Unknown,
            message: None,
            children: Vec::new(),
            host: None,
            pid: None,
            runner_id: None,
            start_time: None,
            stop_time: None,
            last_heartbeat: None,
            heartbeat_sequence: None,
            next_heartbeat_expected: None,
            heartbeat_dead: false,
            uptime_sec: None,
            zombie_deadline: None,
        }
    }
}

/// Callback invoked with each changed view in follow mode
pub type UpdateFn = Arc<dyn Fn(&ServiceView) + Send + Sync>;

/// Handle of a running follow loop
pub struct DiscoveryHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DiscoveryHandle {
    /// Stop following and wait for the loop to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Observer projecting the service table from the bus streams
pub struct DiscoveryClient {
    bus: Arc<dyn Bus>,
    table: Arc<Mutex<HashMap<String, ServiceView>>>,
}

impl DiscoveryClient {
    /// Create a client on a bus handle
    #[must_use]
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// One-shot projection from the retained streams
    ///
    /// Replays the registry first so the table is populated before status
    /// and heartbeat updates are applied, then flags zombies.
    pub async fn snapshot(&self) -> crate::error::Result<Vec<ServiceView>> {
        for filter in [
            subjects::REGISTRY_ALL,
            subjects::STATUS_ALL,
            subjects::HEARTBEAT_ALL,
        ] {
            for msg in self.bus.history(filter).await? {
                Self::project(&self.table, &msg);
            }
        }
        Self::scan_zombies(&self.table, Utc::now(), None);

        let mut views: Vec<ServiceView> = {
            let table = self.table.lock().unwrap();
            table.values().cloned().collect()
        };
        views.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        Ok(views)
    }

    /// Follow the streams, invoking `on_update` for every changed view
    ///
    /// Subscriptions are created before the history replay so no event is
    /// lost in between; the zombie detector runs on a one second tick.
    pub async fn follow(&self, on_update: UpdateFn) -> crate::error::Result<DiscoveryHandle> {
        let mut registry_sub = self.bus.subscribe(subjects::REGISTRY_ALL).await?;
        let mut status_sub = self.bus.subscribe(subjects::STATUS_ALL).await?;
        let mut heartbeat_sub = self.bus.subscribe(subjects::HEARTBEAT_ALL).await?;

        // Warm start from the persistent registry history
        for msg in self.bus.history(subjects::REGISTRY_ALL).await? {
            Self::project(&self.table, &msg);
        }

        let table = Arc::clone(&self.table);
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ZOMBIE_SCAN_PERIOD);
            loop {
                let changed = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    msg = registry_sub.next() => msg,
                    msg = status_sub.next() => msg,
                    msg = heartbeat_sub.next() => msg,
                    _ = ticker.tick() => {
                        Self::scan_zombies(&table, Utc::now(), Some(&on_update));
                        continue;
                    }
                };
                match changed {
                    Some(msg) => {
                        if let Some(service_id) = Self::project(&table, &msg) {
                            let view = table.lock().unwrap().get(&service_id).cloned();
                            if let Some(view) = view {
                                on_update(&view);
                            }
                        }
                    }
                    None => break,
                }
            }
            debug!("discovery follow loop finished");
        });

        Ok(DiscoveryHandle { cancel, task })
    }

    /// Current view of one instance
    #[must_use]
    pub fn view(&self, service_id: &str) -> Option<ServiceView> {
        self.table.lock().unwrap().get(service_id).cloned()
    }

    /// Apply one message to the table; returns the touched service id
    fn project(table: &Mutex<HashMap<String, ServiceView>>, msg: &Message) -> Option<String> {
        if subjects::subject_matches(subjects::REGISTRY_ALL, &msg.subject) {
            let event: RegistryEvent = match serde_json::from_value(msg.payload.clone()) {
                Ok(event) => event,
                Err(e) => {
                    warn!(subject = %msg.subject, "undecodable registry event: {e}");
                    return None;
                }
            };
            let service_id = event.service_id().to_string();
            let mut table = table.lock().unwrap();
            let view = table
                .entry(service_id.clone())
                .or_insert_with(|| ServiceView::new(service_id.clone()));
            Self::apply_registry(view, &event);
            Some(service_id)
        } else if subjects::subject_matches(subjects::STATUS_ALL, &msg.subject) {
            let payload: StatusPayload = match serde_json::from_value(msg.payload.clone()) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(subject = %msg.subject, "undecodable status report: {e}");
                    return None;
                }
            };
            let mut table = table.lock().unwrap();
            let view = table.get_mut(&payload.name)?;
            view.status = payload.status;
            view.message = payload.message;
            view.children = payload.children;
            Some(payload.name)
        } else if subjects::subject_matches(subjects::HEARTBEAT_ALL, &msg.subject) {
            let hb: HeartbeatPayload = match serde_json::from_value(msg.payload.clone()) {
                Ok(hb) => hb,
                Err(e) => {
                    warn!(subject = %msg.subject, "undecodable heartbeat: {e}");
                    return None;
                }
            };
            let mut table = table.lock().unwrap();
            let view = table.get_mut(&hb.service_id)?;
            // Ignore heartbeats older than what we already saw
            if view.last_heartbeat.is_some_and(|seen| seen > hb.timestamp) {
                return None;
            }
            view.last_heartbeat = Some(hb.timestamp);
            view.heartbeat_sequence = Some(hb.sequence);
            view.next_heartbeat_expected = Some(hb.next_heartbeat_expected);
            view.heartbeat_dead = false;
            view.uptime_sec = Some(hb.uptime_sec);
            // Zombie grace is one missed heartbeat
            view.zombie_deadline = match (
                hb.timestamp.to_datetime(),
                hb.next_heartbeat_expected.to_datetime(),
            ) {
                (Some(at), Some(next)) => Some(next + (next - at)),
                _ => None,
            };
            Some(hb.service_id)
        } else {
            None
        }
    }

    fn apply_registry(view: &mut ServiceView, event: &RegistryEvent) {
        match event {
            RegistryEvent::Declared { .. } => {
                view.stage = ServiceStage::Declared;
            }
            RegistryEvent::Start {
                runner_id,
                host,
                pid,
                timestamp,
                ..
            } => {
                view.stage = ServiceStage::Running;
                view.host = Some(host.clone());
                view.pid = Some(*pid);
                view.runner_id = runner_id.clone();
                view.start_time = Some(*timestamp);
                view.stop_time = None;
                view.heartbeat_dead = false;
                view.heartbeat_sequence = None;
            }
            RegistryEvent::Ready { .. } => {
                view.stage = ServiceStage::Running;
            }
            RegistryEvent::Stopping { .. } => {
                view.stage = ServiceStage::Stopping;
            }
            RegistryEvent::Stop {
                exit,
                timestamp,
                uptime_sec,
                ..
            } => {
                view.stage = match exit {
                    schema::ExitClass::Clean => ServiceStage::Stopped,
                    schema::ExitClass::Failed => ServiceStage::Failed,
                    schema::ExitClass::Crashed => ServiceStage::Crashed,
                };
                view.stop_time = Some(*timestamp);
                view.uptime_sec = Some(*uptime_sec);
            }
            RegistryEvent::Crashed { .. } => {
                view.stage = ServiceStage::Crashed;
            }
            RegistryEvent::Restarting { .. } => {
                view.stage = ServiceStage::Restarting;
            }
            RegistryEvent::Failed { .. } => {
                view.stage = ServiceStage::Failed;
            }
        }
    }

    fn scan_zombies(
        table: &Mutex<HashMap<String, ServiceView>>,
        now: DateTime<Utc>,
        on_update: Option<&UpdateFn>,
    ) {
        let mut flagged = Vec::new();
        {
            let mut table = table.lock().unwrap();
            for view in table.values_mut() {
                if view.stage == ServiceStage::Running
                    && !view.heartbeat_dead
                    && view.zombie_deadline.is_some_and(|deadline| now > deadline)
                {
                    view.heartbeat_dead = true;
                    flagged.push(view.clone());
                }
            }
        }
        if let Some(on_update) = on_update {
            for view in &flagged {
                warn!(service_id = %view.service_id, "heartbeat lapsed, marking zombie");
                on_update(view);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus::MemoryBus;

    async fn publish_registry(bus: &Arc<dyn Bus>, event: RegistryEvent) {
        let subject = subjects::registry(event.kind(), event.service_id());
        bus.publish(&subject, &serde_json::to_value(&event).unwrap())
            .await
            .unwrap();
    }

    fn hb(service_id: &str, sequence: u64, at: DateTime<Utc>, period_sec: i64) -> HeartbeatPayload {
        HeartbeatPayload {
            service_id: service_id.to_string(),
            sequence,
            uptime_sec: 1.0,
            status: Status::Ok,
            timestamp: Utc7::from_datetime(at),
            next_heartbeat_expected: Utc7::from_datetime(at + chrono::Duration::seconds(period_sec)),
            metrics: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_projects_lifecycle() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        publish_registry(
            &bus,
            RegistryEvent::Declared {
                service_id: "echo.t1".into(),
                service_type: "echo".into(),
                variant: "t1".into(),
                launcher_id: Some("launcher.h-1".into()),
                enabled: true,
                timestamp: Utc7::now(),
            },
        )
        .await;
        publish_registry(
            &bus,
            RegistryEvent::Start {
                service_id: "echo.t1".into(),
                runner_id: Some("launcher.h-1.echo.t1".into()),
                launcher_id: Some("launcher.h-1".into()),
                host: "obs1".into(),
                pid: 4242,
                timestamp: Utc7::now(),
            },
        )
        .await;
        publish_registry(&bus, RegistryEvent::ready("echo.t1")).await;

        bus.publish(
            &subjects::status("echo.t1"),
            &serde_json::to_value(StatusPayload {
                name: "echo.t1".into(),
                status: Status::Busy,
                message: Some("Processing tasks (1 active)".into()),
                timestamp: Utc7::now(),
                own_status: None,
                children: vec![],
                metrics: serde_json::Map::new(),
            })
            .unwrap(),
        )
        .await
        .unwrap();

        let client = DiscoveryClient::new(Arc::clone(&bus));
        let views = client.snapshot().await.unwrap();
        assert_eq!(views.len(), 1);
        let view = &views[0];
        assert_eq!(view.stage, ServiceStage::Running);
        assert_eq!(view.status, Status::Busy);
        assert_eq!(view.host.as_deref(), Some("obs1"));
        assert_eq!(view.pid, Some(4242));
        assert!(!view.heartbeat_dead);
    }

    #[tokio::test]
    async fn test_stop_classification_maps_to_stage() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        for (variant, exit, expected) in [
            ("clean", schema::ExitClass::Clean, ServiceStage::Stopped),
            ("failed", schema::ExitClass::Failed, ServiceStage::Failed),
            ("crashed", schema::ExitClass::Crashed, ServiceStage::Crashed),
        ] {
            let id = format!("echo.{variant}");
            publish_registry(
                &bus,
                RegistryEvent::Start {
                    service_id: id.clone(),
                    runner_id: None,
                    launcher_id: None,
                    host: "obs1".into(),
                    pid: 1,
                    timestamp: Utc7::now(),
                },
            )
            .await;
            publish_registry(&bus, RegistryEvent::stop(id.clone(), 5.0, exit, None)).await;

            let client = DiscoveryClient::new(Arc::clone(&bus));
            let _ = client.snapshot().await.unwrap();
            assert_eq!(client.view(&id).unwrap().stage, expected, "{id}");
        }
    }

    #[tokio::test]
    async fn test_zombie_detection_is_display_only() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        publish_registry(
            &bus,
            RegistryEvent::Start {
                service_id: "echo.t1".into(),
                runner_id: None,
                launcher_id: None,
                host: "obs1".into(),
                pid: 1,
                timestamp: Utc7::now(),
            },
        )
        .await;

        // Heartbeat promised a successor 30s after a timestamp 90s ago;
        // the grace (one period) is long past.
        let stale = Utc::now() - chrono::Duration::seconds(90);
        bus.publish(
            &subjects::heartbeat("echo.t1"),
            &serde_json::to_value(hb("echo.t1", 3, stale, 30)).unwrap(),
        )
        .await
        .unwrap();

        let client = DiscoveryClient::new(Arc::clone(&bus));
        let _ = client.snapshot().await.unwrap();
        let view = client.view("echo.t1").unwrap();
        assert!(view.heartbeat_dead);
        // Registry still says running
        assert_eq!(view.stage, ServiceStage::Running);
        assert_eq!(view.heartbeat_sequence, Some(3));
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_is_not_a_zombie() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        publish_registry(
            &bus,
            RegistryEvent::Start {
                service_id: "echo.t1".into(),
                runner_id: None,
                launcher_id: None,
                host: "obs1".into(),
                pid: 1,
                timestamp: Utc7::now(),
            },
        )
        .await;
        bus.publish(
            &subjects::heartbeat("echo.t1"),
            &serde_json::to_value(hb("echo.t1", 1, Utc::now(), 30)).unwrap(),
        )
        .await
        .unwrap();

        let client = DiscoveryClient::new(Arc::clone(&bus));
        let _ = client.snapshot().await.unwrap();
        assert!(!client.view("echo.t1").unwrap().heartbeat_dead);
    }

    #[tokio::test]
    async fn test_follow_sees_live_updates() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let client = DiscoveryClient::new(Arc::clone(&bus));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = client
            .follow(Arc::new(move |view: &ServiceView| {
                let _ = tx.send((view.service_id.clone(), view.stage));
            }))
            .await
            .unwrap();

        publish_registry(
            &bus,
            RegistryEvent::Declared {
                service_id: "echo.t1".into(),
                service_type: "echo".into(),
                variant: "t1".into(),
                launcher_id: None,
                enabled: true,
                timestamp: Utc7::now(),
            },
        )
        .await;

        let (id, stage) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "echo.t1");
        assert_eq!(stage, ServiceStage::Declared);
        handle.stop().await;
    }
}
