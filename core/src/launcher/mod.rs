//! Multi-service launcher
//!
//! The [`Launcher`] is the outer supervisor: it reads the configured
//! service list, creates one [`Runner`] per descriptor, and supervises
//! them either cooperatively in its own process or as subprocesses.
//!
//! Startup order is part of the protocol: the launcher publishes a
//! `declared` registry event for **every** configured instance, disabled
//! ones included, before anything starts; observers learn the full
//! configured set from the stream alone. Runners then start in parallel
//! and emit their own lifecycle events.
//!
//! The launcher exposes its own monitor, aggregating the runner statuses,
//! and extends the RPC surface with `list`, `start.<service_id>` and
//! `stop.<service_id>`.

pub mod runner;

pub use runner::{ExitInfo, LaunchMode, Runner, RunnerState};

use crate::context::ProcessContext;
use crate::controller::DEFAULT_STOP_GRACE;
use crate::error::{Result, TcsError};
use crate::monitor::{local_hostname, BusMonitor, Monitor, MonitorContext};
use schema::{RegistryEvent, ServiceDescriptor, Status, Utc7};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct RunnerSlot {
    runner: Arc<Runner>,
    task: Option<JoinHandle<()>>,
}

/// Supervisor of all configured service instances
pub struct Launcher {
    context: Arc<ProcessContext>,
    launcher_id: String,
    mode: LaunchMode,
    descriptors: Vec<ServiceDescriptor>,
    bus_monitor: Arc<BusMonitor>,
    runners: Mutex<HashMap<String, RunnerSlot>>,
    stop_grace: Duration,
}

impl Launcher {
    /// Build a launcher from the context's configured services
    pub fn new(context: Arc<ProcessContext>, mode: LaunchMode) -> Result<Arc<Self>> {
        let descriptors = context.config().services()?;

        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            if !seen.insert(descriptor.service_id()) {
                return Err(TcsError::Config(format!(
                    "duplicate service id '{}'",
                    descriptor.service_id()
                )));
            }
        }

        let variant = format!("{}-{}", local_hostname(), std::process::id());
        let launcher_id = format!("launcher.{variant}");
        let monitor = Monitor::new(launcher_id.clone());
        monitor.set_status(Status::Startup, "Launcher initializing");
        let bus_monitor = BusMonitor::new(
            monitor,
            context.bus(),
            MonitorContext::new("launcher", &variant),
        );

        let launcher = Arc::new(Self {
            context,
            launcher_id,
            mode,
            descriptors,
            bus_monitor,
            runners: Mutex::new(HashMap::new()),
            stop_grace: DEFAULT_STOP_GRACE,
        });

        info!(
            launcher_id = %launcher.launcher_id,
            services = launcher.descriptors.len(),
            ?mode,
            "launcher created"
        );
        Ok(launcher)
    }

    /// Launcher identity
    #[must_use]
    pub fn launcher_id(&self) -> &str {
        &self.launcher_id
    }

    /// The launcher's own monitor (aggregates runner statuses)
    #[must_use]
    pub fn monitor(&self) -> &Monitor {
        self.bus_monitor.monitor()
    }

    /// Configured descriptors
    #[must_use]
    pub fn descriptors(&self) -> &[ServiceDescriptor] {
        &self.descriptors
    }

    /// Look up a runner by service id
    #[must_use]
    pub fn runner(&self, service_id: &str) -> Option<Arc<Runner>> {
        self.runners
            .lock()
            .unwrap()
            .get(service_id)
            .map(|slot| Arc::clone(&slot.runner))
    }

    /// Declare every configured instance, then start the enabled ones
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        // Populate the discovery stream before anything starts
        for descriptor in &self.descriptors {
            self.bus_monitor
                .publish_registry(RegistryEvent::Declared {
                    service_id: descriptor.service_id(),
                    service_type: descriptor.service_type.clone(),
                    variant: descriptor.variant.clone(),
                    launcher_id: Some(self.launcher_id.clone()),
                    enabled: descriptor.enabled,
                    timestamp: Utc7::now(),
                })
                .await;
        }

        self.register_rpc();
        self.bus_monitor.start().await;

        for descriptor in self.descriptors.clone() {
            if !descriptor.enabled {
                info!(service_id = %descriptor.service_id(), "service disabled, not starting");
                continue;
            }
            self.spawn_runner(descriptor);
        }

        self.monitor().set_status(Status::Ok, "Launcher running");
        info!(launcher_id = %self.launcher_id, "launcher started");
        Ok(())
    }

    /// Create a runner for `descriptor`, attach its monitor, and start its
    /// supervision task
    fn spawn_runner(self: &Arc<Self>, descriptor: ServiceDescriptor) {
        let service_id = descriptor.service_id();
        let runner = Runner::new(
            descriptor,
            Arc::clone(&self.context),
            self.mode,
            self.launcher_id.clone(),
            self.stop_grace,
        );
        self.monitor().add_child(runner.monitor().clone());
        let task = runner.spawn();
        self.runners.lock().unwrap().insert(
            service_id,
            RunnerSlot {
                runner,
                task: Some(task),
            },
        );
    }

    fn register_rpc(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.bus_monitor.add_rpc_command(
            "list",
            Arc::new(move |_rest, _payload| {
                let weak = Weak::clone(&weak);
                Box::pin(async move {
                    let Some(this) = weak.upgrade() else {
                        return json!({ "error": "launcher is gone" });
                    };
                    let runners = this.runners.lock().unwrap();
                    let services: Vec<_> = this
                        .descriptors
                        .iter()
                        .map(|d| {
                            let id = d.service_id();
                            let state = runners
                                .get(&id)
                                .map(|slot| format!("{:?}", slot.runner.state()));
                            json!({
                                "service_id": id,
                                "enabled": d.enabled,
                                "restart": d.restart,
                                "state": state,
                            })
                        })
                        .collect();
                    json!({ "launcher_id": this.launcher_id, "services": services })
                })
            }),
        );

        let weak = Arc::downgrade(self);
        self.bus_monitor.add_rpc_command(
            "start",
            Arc::new(move |service_id, _payload| {
                let weak = Weak::clone(&weak);
                Box::pin(async move {
                    let Some(this) = weak.upgrade() else {
                        return json!({ "error": "launcher is gone" });
                    };
                    match this.start_service(&service_id) {
                        Ok(()) => json!({ "ok": true, "service_id": service_id }),
                        Err(e) => json!({ "ok": false, "error": e.to_string() }),
                    }
                })
            }),
        );

        let weak = Arc::downgrade(self);
        self.bus_monitor.add_rpc_command(
            "logs",
            Arc::new(move |service_id, _payload| {
                let weak = Weak::clone(&weak);
                Box::pin(async move {
                    let Some(this) = weak.upgrade() else {
                        return json!({ "error": "launcher is gone" });
                    };
                    let Some(runner) = this.runner(&service_id) else {
                        return json!({ "error": format!("unknown service '{service_id}'") });
                    };
                    let (next_seq, entries) = runner.log_snapshot();
                    json!({
                        "service_id": service_id,
                        "next_seq": next_seq,
                        "entries": entries,
                    })
                })
            }),
        );

        let weak = Arc::downgrade(self);
        self.bus_monitor.add_rpc_command(
            "stop",
            Arc::new(move |service_id, _payload| {
                let weak = Weak::clone(&weak);
                Box::pin(async move {
                    let Some(this) = weak.upgrade() else {
                        return json!({ "error": "launcher is gone" });
                    };
                    match this.stop_service(&service_id) {
                        Ok(()) => json!({ "ok": true, "service_id": service_id }),
                        Err(e) => json!({ "ok": false, "error": e.to_string() }),
                    }
                })
            }),
        );
    }

    /// Start (or relaunch) one configured service by id
    pub fn start_service(self: &Arc<Self>, service_id: &str) -> Result<()> {
        let descriptor = self
            .descriptors
            .iter()
            .find(|d| d.service_id() == service_id)
            .cloned()
            .ok_or_else(|| TcsError::Other(format!("unknown service '{service_id}'")))?;

        let running = {
            let runners = self.runners.lock().unwrap();
            runners.get(service_id).is_some_and(|slot| {
                slot.task.as_ref().is_some_and(|task| !task.is_finished())
            })
        };
        if running {
            return Err(TcsError::Other(format!(
                "service '{service_id}' is already supervised"
            )));
        }

        // Runners are single-use; a relaunch gets a fresh one
        self.monitor().remove_child(&format!("runner.{service_id}"));
        self.spawn_runner(descriptor);
        Ok(())
    }

    /// Request a graceful stop of one service by id
    pub fn stop_service(&self, service_id: &str) -> Result<()> {
        let runners = self.runners.lock().unwrap();
        let slot = runners
            .get(service_id)
            .ok_or_else(|| TcsError::Other(format!("service '{service_id}' is not running")))?;
        slot.runner.request_stop();
        Ok(())
    }

    /// Stop all runners concurrently, then the launcher's own monitoring
    ///
    /// Runners that do not finish within the grace window (plus a margin
    /// for subprocess signal escalation) are abandoned.
    pub async fn shutdown(&self) {
        info!(launcher_id = %self.launcher_id, "launcher shutting down");
        self.monitor()
            .set_status(Status::Shutdown, "Launcher stopping");

        let slots: Vec<(String, Option<JoinHandle<()>>, Arc<Runner>)> = {
            let mut runners = self.runners.lock().unwrap();
            runners
                .iter_mut()
                .map(|(id, slot)| (id.clone(), slot.task.take(), Arc::clone(&slot.runner)))
                .collect()
        };

        for (_, _, runner) in &slots {
            runner.request_stop();
        }

        let deadline = self.stop_grace + Duration::from_secs(2);
        let joins = slots.into_iter().filter_map(|(id, task, _)| {
            task.map(|task| async move {
                if tokio::time::timeout(deadline, task).await.is_err() {
                    warn!(service_id = %id, "runner did not stop in time, abandoning");
                }
            })
        });
        futures::future::join_all(joins).await;

        self.bus_monitor.stop().await;
        info!(launcher_id = %self.launcher_id, "launcher shutdown complete");
    }
}
