//! Hierarchical health monitors
//!
//! A [`Monitor`] is one node of the monitored hierarchy: it carries its own
//! status, owns its children, and aggregates worst-wins over the subtree.
//! Monitors are cheap cloneable handles onto shared state; all mutation
//! goes through methods so concurrent tasks (healthcheck loop, heartbeat
//! loop, the service itself) can share one handle safely.
//!
//! The monitor itself knows nothing about the bus. [`BusMonitor`] wraps a
//! monitor tree and publishes its changes; it installs a change notifier
//! that every node of the tree shares, so a status change anywhere in the
//! subtree schedules a publish.
//!
//! ## Task tracking
//!
//! [`Monitor::track_task`] returns a guard that flips the monitor between
//! `Busy` and `Idle`: entering sets `Busy` immediately, leaving arms a one
//! second timer that settles back to `Idle` unless another task enters
//! first. Guards are re-entrant; nested tasks never expose `Idle`.

pub mod bus_monitor;

pub use bus_monitor::{local_hostname, BusMonitor, MonitorContext, RpcCommand};

use schema::{aggregate, ChildStatus, Status, StatusReport, Utc7};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Healthcheck callback: `None` means "no opinion"
pub type HealthcheckFn = Arc<dyn Fn() -> Option<Status> + Send + Sync>;

/// Metric callback: returns a flat map merged into published reports
pub type MetricFn = Arc<dyn Fn() -> Map<String, Value> + Send + Sync>;

/// Delay before a monitor with no active tasks settles back to `Idle`
const IDLE_SETTLE: Duration = Duration::from_secs(1);

struct MonitorState {
    status: Status,
    message: Option<String>,
    children: HashMap<String, Monitor>,
    healthchecks: Vec<HealthcheckFn>,
    metric_cbs: Vec<MetricFn>,
    active_tasks: u32,
    task_tracking: bool,
    idle_epoch: u64,
    notifier: Option<mpsc::UnboundedSender<()>>,
}

struct MonitorInner {
    name: String,
    parent_name: Option<String>,
    state: Mutex<MonitorState>,
}

/// Handle onto one node of the monitored hierarchy
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

/// Point-in-time view of a monitor subtree
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// Aggregated status of the subtree
    pub status: Status,
    /// Status of the node itself, children excluded
    pub own_status: Status,
    /// Current status message
    pub message: Option<String>,
    /// Snapshot time (UTC)
    pub timestamp: Utc7,
    /// Direct children with their effective statuses
    pub children: Vec<ChildStatus>,
    /// Merged output of the metric callbacks
    pub metrics: Map<String, Value>,
}

impl StatusSnapshot {
    /// Reduce to the plain report form
    #[must_use]
    pub fn into_report(self) -> StatusReport {
        StatusReport {
            status: self.status,
            message: self.message,
            timestamp: self.timestamp,
            metrics: (!self.metrics.is_empty()).then_some(self.metrics),
        }
    }
}

impl Monitor {
    /// Create a monitor with no parent hint
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_parent_name(name, None)
    }

    /// Create a monitor carrying a parent name used purely for display
    /// grouping by observers
    #[must_use]
    pub fn with_parent_name(name: impl Into<String>, parent_name: Option<String>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                name: name.into(),
                parent_name,
                state: Mutex::new(MonitorState {
                    status: Status::Unknown,
                    message: None,
                    children: HashMap::new(),
                    healthchecks: Vec::new(),
                    metric_cbs: Vec::new(),
                    active_tasks: 0,
                    task_tracking: false,
                    idle_epoch: 0,
                    notifier: None,
                }),
            }),
        }
    }

    /// Monitor name (dot-namespaced, arbitrary depth)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Display-only parent hint
    #[must_use]
    pub fn parent_name(&self) -> Option<&str> {
        self.inner.parent_name.as_deref()
    }

    /// Current own status, children excluded
    #[must_use]
    pub fn status(&self) -> Status {
        self.inner.state.lock().unwrap().status
    }

    /// Current status message
    #[must_use]
    pub fn message(&self) -> Option<String> {
        self.inner.state.lock().unwrap().message.clone()
    }

    /// Replace the own status component; does not touch children
    pub fn set_status(&self, status: Status, message: &str) {
        let changed = {
            let mut state = self.inner.state.lock().unwrap();
            let old = state.status;
            state.status = status;
            state.message = Some(message.to_string());
            old != status
        };
        debug!(monitor = %self.inner.name, %status, message, "status set");
        if changed {
            self.notify_changed();
        }
    }

    /// Revert a manually recoverable error state back to operation
    ///
    /// No-op unless the own status is `Error`, `Degraded` or `Failed`; the
    /// replacement is `Idle`/`Busy` when task tracking is active, `Ok`
    /// otherwise, with the message `"Error resolved"`.
    pub fn cancel_error_status(&self) {
        let next = {
            let state = self.inner.state.lock().unwrap();
            if !state.status.is_error_like() {
                return;
            }
            if state.task_tracking {
                if state.active_tasks > 0 {
                    Status::Busy
                } else {
                    Status::Idle
                }
            } else {
                Status::Ok
            }
        };
        self.set_status(next, "Error resolved");
    }

    /// Add a child monitor; an existing child with the same name is replaced
    ///
    /// Child ownership is exclusive: the child belongs to this subtree and
    /// inherits its change notifier.
    pub fn add_child(&self, child: Monitor) {
        let notifier = {
            let mut state = self.inner.state.lock().unwrap();
            let notifier = state.notifier.clone();
            if state
                .children
                .insert(child.name().to_string(), child.clone())
                .is_some()
            {
                warn!(
                    monitor = %self.inner.name,
                    child = child.name(),
                    "replacing existing child monitor"
                );
            }
            notifier
        };
        if let Some(tx) = notifier {
            child.install_notifier(tx);
        }
        debug!(monitor = %self.inner.name, child = child.name(), "child added");
        self.notify_changed();
    }

    /// Remove a child by name, returning its handle if present
    pub fn remove_child(&self, name: &str) -> Option<Monitor> {
        let removed = self.inner.state.lock().unwrap().children.remove(name);
        if removed.is_some() {
            debug!(monitor = %self.inner.name, child = name, "child removed");
            self.notify_changed();
        }
        removed
    }

    /// Look up a direct child by name
    #[must_use]
    pub fn child(&self, name: &str) -> Option<Monitor> {
        self.inner.state.lock().unwrap().children.get(name).cloned()
    }

    /// Register a periodic healthcheck callback
    pub fn add_healthcheck_cb<F>(&self, callback: F)
    where
        F: Fn() -> Option<Status> + Send + Sync + 'static,
    {
        self.inner
            .state
            .lock()
            .unwrap()
            .healthchecks
            .push(Arc::new(callback));
    }

    /// Register a metric callback evaluated at publish time
    pub fn add_metric_cb<F>(&self, callback: F)
    where
        F: Fn() -> Map<String, Value> + Send + Sync + 'static,
    {
        self.inner
            .state
            .lock()
            .unwrap()
            .metric_cbs
            .push(Arc::new(callback));
    }

    /// Effective status: worst-wins over the own status and every
    /// descendant's effective status
    #[must_use]
    pub fn effective_status(&self) -> Status {
        let (own, children) = {
            let state = self.inner.state.lock().unwrap();
            (state.status, state.children.values().cloned().collect::<Vec<_>>())
        };
        aggregate(
            std::iter::once(own).chain(children.iter().map(Monitor::effective_status)),
        )
    }

    /// Produce the current effective report with child summaries and
    /// merged metrics
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let (own, message, children) = {
            let state = self.inner.state.lock().unwrap();
            (
                state.status,
                state.message.clone(),
                state.children.values().cloned().collect::<Vec<_>>(),
            )
        };

        let mut summaries: Vec<ChildStatus> = children
            .iter()
            .map(|c| ChildStatus {
                name: c.name().to_string(),
                status: c.effective_status(),
                message: c.message(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));

        let effective = aggregate(std::iter::once(own).chain(summaries.iter().map(|c| c.status)));

        StatusSnapshot {
            status: effective,
            own_status: own,
            message,
            timestamp: Utc7::now(),
            children: summaries,
            metrics: self.collect_metrics(),
        }
    }

    /// Evaluate the metric callbacks and merge their maps
    ///
    /// Callbacks run outside the monitor lock, so they may call back into
    /// the monitor.
    #[must_use]
    pub fn collect_metrics(&self) -> Map<String, Value> {
        let callbacks: Vec<MetricFn> = {
            let state = self.inner.state.lock().unwrap();
            state.metric_cbs.iter().map(Arc::clone).collect()
        };
        let mut merged = Map::new();
        for cb in callbacks {
            match catch_unwind(AssertUnwindSafe(|| cb())) {
                Ok(map) => merged.extend(map),
                Err(_) => {
                    warn!(monitor = %self.inner.name, "metric callback panicked");
                }
            }
        }
        merged
    }

    /// Evaluate every healthcheck callback once, returning the opinions
    ///
    /// A panicking callback counts as an `Error` opinion. Callbacks run
    /// outside the monitor lock.
    #[must_use]
    pub fn healthcheck_opinions(&self) -> Vec<Option<Status>> {
        let callbacks: Vec<HealthcheckFn> = {
            let state = self.inner.state.lock().unwrap();
            state.healthchecks.iter().map(Arc::clone).collect()
        };
        let mut opinions = Vec::with_capacity(callbacks.len());
        for cb in callbacks {
            match catch_unwind(AssertUnwindSafe(|| cb())) {
                Ok(opinion) => opinions.push(opinion),
                Err(_) => {
                    warn!(monitor = %self.inner.name, "healthcheck callback panicked");
                    opinions.push(Some(Status::Error));
                }
            }
        }
        opinions
    }

    /// Run one healthcheck pass over this node and its subtree
    ///
    /// Non-null opinions are aggregated worst-wins with the current own
    /// status; `None` opinions never downgrade it.
    pub fn run_healthchecks(&self) {
        let opinions = self.healthcheck_opinions();
        let current = self.status();
        let next = aggregate(std::iter::once(current).chain(opinions.into_iter().flatten()));
        if next != current {
            self.set_status(next, "Updated from healthcheck");
        }

        let children: Vec<Monitor> = {
            let state = self.inner.state.lock().unwrap();
            state.children.values().cloned().collect()
        };
        for child in children {
            child.run_healthchecks();
        }
    }

    /// Scoped task tracking: `Idle`→`Busy` on entry, delayed `Busy`→`Idle`
    /// on exit of the last concurrent guard
    #[must_use]
    pub fn track_task(&self) -> TaskGuard {
        let (status_update, count) = {
            let mut state = self.inner.state.lock().unwrap();
            state.active_tasks += 1;
            state.task_tracking = true;
            state.idle_epoch = state.idle_epoch.wrapping_add(1);
            let update =
                !matches!(state.status, Status::Busy | Status::Error | Status::Failed);
            (update, state.active_tasks)
        };
        let message = format!("Processing tasks ({count} active)");
        if status_update {
            self.set_status(Status::Busy, &message);
        } else {
            // Refresh the message without a status transition.
            let mut state = self.inner.state.lock().unwrap();
            if state.status == Status::Busy {
                state.message = Some(message);
            }
        }
        TaskGuard {
            monitor: self.clone(),
        }
    }

    fn task_finished(&self) {
        let idle_epoch = {
            let mut state = self.inner.state.lock().unwrap();
            state.active_tasks = state.active_tasks.saturating_sub(1);
            if state.active_tasks > 0 {
                let count = state.active_tasks;
                if state.status == Status::Busy {
                    state.message = Some(format!("Processing tasks ({count} active)"));
                }
                return;
            }
            state.idle_epoch
        };

        let monitor = self.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(IDLE_SETTLE).await;
                monitor.settle_idle(idle_epoch);
            });
        } else {
            // Outside a runtime there is nothing to delay on.
            monitor.settle_idle(idle_epoch);
        }
    }

    fn settle_idle(&self, epoch: u64) {
        let settle = {
            let state = self.inner.state.lock().unwrap();
            state.active_tasks == 0 && state.idle_epoch == epoch && state.status == Status::Busy
        };
        if settle {
            self.set_status(Status::Idle, "No active tasks");
        }
    }

    /// Install the change notifier on this node and its whole subtree
    pub(crate) fn install_notifier(&self, tx: mpsc::UnboundedSender<()>) {
        let children: Vec<Monitor> = {
            let mut state = self.inner.state.lock().unwrap();
            state.notifier = Some(tx.clone());
            state.children.values().cloned().collect()
        };
        for child in children {
            child.install_notifier(tx.clone());
        }
    }

    fn notify_changed(&self) {
        let tx = self.inner.state.lock().unwrap().notifier.clone();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

/// Guard returned by [`Monitor::track_task`]
///
/// Dropping the guard marks the task as finished on every exit path.
pub struct TaskGuard {
    monitor: Monitor,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.monitor.task_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, sleep};

    #[test]
    fn test_effective_status_is_worst_wins() {
        let root = Monitor::new("root");
        root.set_status(Status::Ok, "fine");

        let a = Monitor::new("a");
        a.set_status(Status::Ok, "fine");
        let b = Monitor::new("b");
        b.set_status(Status::Degraded, "half broken");
        root.add_child(a);
        root.add_child(b);

        assert_eq!(root.status(), Status::Ok);
        assert_eq!(root.effective_status(), Status::Degraded);

        let snap = root.snapshot();
        assert_eq!(snap.status, Status::Degraded);
        assert_eq!(snap.own_status, Status::Ok);
        assert_eq!(snap.children.len(), 2);
        assert_eq!(snap.children[1].name, "b");
        assert_eq!(snap.children[1].status, Status::Degraded);
    }

    #[test]
    fn test_aggregation_recurses_through_grandchildren() {
        let root = Monitor::new("root");
        root.set_status(Status::Ok, "fine");
        let mid = Monitor::new("mid");
        mid.set_status(Status::Ok, "fine");
        let leaf = Monitor::new("leaf");
        leaf.set_status(Status::Error, "broken");
        mid.add_child(leaf);
        root.add_child(mid);

        assert_eq!(root.effective_status(), Status::Error);
    }

    #[test]
    fn test_cancel_error_status() {
        let monitor = Monitor::new("m");
        monitor.set_status(Status::Ok, "fine");
        monitor.cancel_error_status();
        // No-op outside the error set
        assert_eq!(monitor.status(), Status::Ok);
        assert_eq!(monitor.message(), Some("fine".to_string()));

        for status in [Status::Error, Status::Degraded, Status::Failed] {
            monitor.set_status(status, "broken");
            monitor.cancel_error_status();
            assert_eq!(monitor.status(), Status::Ok);
            assert_eq!(monitor.message(), Some("Error resolved".to_string()));
        }
    }

    #[tokio::test]
    async fn test_cancel_error_status_with_task_tracking() {
        let monitor = Monitor::new("m");
        let _guard = monitor.track_task();
        monitor.set_status(Status::Error, "broken");
        monitor.cancel_error_status();
        assert_eq!(monitor.status(), Status::Busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_task_busy_idle_cycle() {
        let monitor = Monitor::new("m");
        monitor.set_status(Status::Ok, "fine");

        {
            let _guard = monitor.track_task();
            assert_eq!(monitor.status(), Status::Busy);
        }
        // Not idle yet: the settle timer is one second
        assert_eq!(monitor.status(), Status::Busy);
        advance(Duration::from_millis(1100)).await;
        sleep(Duration::from_millis(1)).await;
        assert_eq!(monitor.status(), Status::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_task_reentry_cancels_idle() {
        let monitor = Monitor::new("m");
        {
            let _guard = monitor.track_task();
        }
        // Re-enter within the settle window
        advance(Duration::from_millis(500)).await;
        let guard = monitor.track_task();
        advance(Duration::from_millis(1000)).await;
        sleep(Duration::from_millis(1)).await;
        // The stale timer must not flip an active monitor to Idle
        assert_eq!(monitor.status(), Status::Busy);
        drop(guard);
        advance(Duration::from_millis(1100)).await;
        sleep(Duration::from_millis(1)).await;
        assert_eq!(monitor.status(), Status::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_guards_never_expose_idle() {
        let monitor = Monitor::new("m");
        let outer = monitor.track_task();
        let inner = monitor.track_task();
        drop(inner);
        advance(Duration::from_millis(1500)).await;
        sleep(Duration::from_millis(1)).await;
        assert_eq!(monitor.status(), Status::Busy);
        drop(outer);
        advance(Duration::from_millis(1100)).await;
        sleep(Duration::from_millis(1)).await;
        assert_eq!(monitor.status(), Status::Idle);
    }

    #[test]
    fn test_healthcheck_aggregates_with_own_status() {
        let monitor = Monitor::new("m");
        monitor.set_status(Status::Ok, "fine");
        monitor.add_healthcheck_cb(|| None);
        monitor.run_healthchecks();
        // No opinion must not downgrade
        assert_eq!(monitor.status(), Status::Ok);

        monitor.add_healthcheck_cb(|| Some(Status::Degraded));
        monitor.run_healthchecks();
        assert_eq!(monitor.status(), Status::Degraded);
        assert_eq!(monitor.message(), Some("Updated from healthcheck".to_string()));

        // An Ok opinion never improves a worse own status
        monitor.run_healthchecks();
        assert_eq!(monitor.status(), Status::Degraded);
    }

    #[test]
    fn test_metric_callbacks_merge() {
        let monitor = Monitor::new("m");
        monitor.add_metric_cb(|| {
            let mut m = Map::new();
            m.insert("queue".into(), 3.into());
            m
        });
        monitor.add_metric_cb(|| {
            let mut m = Map::new();
            m.insert("errors".into(), 0.into());
            m
        });
        let metrics = monitor.collect_metrics();
        assert_eq!(metrics.get("queue"), Some(&Value::from(3)));
        assert_eq!(metrics.get("errors"), Some(&Value::from(0)));
    }

    #[test]
    fn test_child_replacement_and_removal() {
        let root = Monitor::new("root");
        let a1 = Monitor::new("a");
        a1.set_status(Status::Ok, "first");
        root.add_child(a1);
        let a2 = Monitor::new("a");
        a2.set_status(Status::Warning, "second");
        root.add_child(a2);

        assert_eq!(root.child("a").unwrap().status(), Status::Warning);
        assert!(root.remove_child("a").is_some());
        assert!(root.child("a").is_none());
        assert!(root.remove_child("a").is_none());
    }
}
