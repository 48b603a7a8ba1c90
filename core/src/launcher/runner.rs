//! Per-descriptor supervision
//!
//! A [`Runner`] owns the lifecycle of one configured service instance and
//! applies its restart policy:
//!
//! ```text
//! Starting → Running → (Exited|Crashed) → (Restarting|GivenUp|Stopped)
//! ```
//!
//! Two launch modes exist. In-process mode drives a [`ServiceController`]
//! inside the launcher's own process context; subprocess mode spawns the
//! standalone entry of the service in a child process and watches its
//! handle. In both modes the runner emits the supervisor-side registry
//! events (`crashed`, `restarting`, `failed`) on the service's subject.
//!
//! Restart accounting uses a sliding window: before a restart, attempts
//! older than `restart_window` are dropped; when the remaining count
//! reaches `restart_max` (> 0), the runner gives up and emits `failed`
//! with reason `restart_limit`. Restart decisions never block event
//! publishing.

use crate::context::ProcessContext;
use crate::controller::{ControllerDeps, ServiceController};
use crate::error::Result;
use crate::logging::{LogEntry, LogRing, LogStream};
use crate::monitor::Monitor;
use crate::process::unix as process;
use bus::subjects;
use schema::{ExitClass, RegistryEvent, RestartPolicy, ServiceDescriptor, Status, Utc7};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lines of child output retained per runner
const LOG_RING_CAPACITY: usize = 512;

/// Supervision state of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Launch in progress
    Starting,
    /// Service is up
    Running,
    /// Service exited normally
    Exited,
    /// Service died abnormally
    Crashed,
    /// Back-off elapsed, relaunching
    Restarting,
    /// Restart limit reached; no further attempts
    GivenUp,
    /// Stopped on request
    Stopped,
}

/// How the runner hosts the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Controller in the launcher's own process
    InProcess,
    /// Child process running the standalone service entry
    Subprocess,
}

/// How one service run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, for subprocess runs that exited
    pub code: Option<i32>,
    /// Terminating signal, for subprocess runs
    pub signal: Option<i32>,
    /// In-process service raised (terminal `Failed` state)
    pub raised: bool,
    /// The launch itself failed (missing executable, failed initialize)
    pub spawn_failed: bool,
}

impl ExitInfo {
    fn clean() -> Self {
        Self {
            code: Some(0),
            signal: None,
            raised: false,
            spawn_failed: false,
        }
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        let (code, signal) = process::exit_parts(status);
        Self {
            code,
            signal,
            raised: false,
            spawn_failed: false,
        }
    }

    fn raised() -> Self {
        Self {
            code: None,
            signal: None,
            raised: true,
            spawn_failed: false,
        }
    }

    fn spawn_failure() -> Self {
        Self {
            code: None,
            signal: None,
            raised: false,
            spawn_failed: true,
        }
    }

    /// Exit code ≠ 0, signal death, raised error or failed spawn
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.raised || self.spawn_failed || self.signal.is_some() || self.code != Some(0)
    }

    /// Exit code > 128 or death by signal; raised maps here for
    /// in-process services
    #[must_use]
    pub fn is_abnormal(&self) -> bool {
        self.raised
            || self.spawn_failed
            || self.signal.is_some()
            || self.code.is_some_and(|c| c > 128)
    }
}

/// Restart decision for one exit under one policy
#[must_use]
pub fn wants_restart(policy: RestartPolicy, exit: &ExitInfo) -> bool {
    match policy {
        RestartPolicy::No => false,
        RestartPolicy::OnFailure => exit.is_failure(),
        RestartPolicy::OnAbnormal => exit.is_abnormal(),
        RestartPolicy::Always => true,
    }
}

enum Launched {
    Subprocess {
        child: process::ChildProcess,
        relay: Vec<JoinHandle<()>>,
        started: Instant,
    },
    InProcess {
        controller: Arc<ServiceController>,
    },
}

/// Supervisor of one configured service instance
pub struct Runner {
    descriptor: ServiceDescriptor,
    service_id: String,
    runner_id: String,
    launcher_id: String,
    mode: LaunchMode,
    context: Arc<ProcessContext>,
    config_file: Option<PathBuf>,
    monitor: Monitor,
    state_tx: watch::Sender<RunnerState>,
    restart_history: Mutex<VecDeque<Instant>>,
    attempt: AtomicU32,
    cancel: CancellationToken,
    log_ring: Arc<Mutex<LogRing>>,
    stop_grace: Duration,
}

impl Runner {
    /// Create a runner for one descriptor
    #[must_use]
    pub fn new(
        descriptor: ServiceDescriptor,
        context: Arc<ProcessContext>,
        mode: LaunchMode,
        launcher_id: String,
        stop_grace: Duration,
    ) -> Arc<Self> {
        let service_id = descriptor.service_id();
        let runner_id = format!("{launcher_id}.{service_id}");
        let monitor = Monitor::new(format!("runner.{service_id}"));
        monitor.set_status(Status::Unknown, "Not started");
        let (state_tx, _) = watch::channel(RunnerState::Starting);
        let config_file = context.config_file().cloned();
        Arc::new(Self {
            descriptor,
            service_id,
            runner_id,
            launcher_id,
            mode,
            context,
            config_file,
            monitor,
            state_tx,
            restart_history: Mutex::new(VecDeque::new()),
            attempt: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            log_ring: Arc::new(Mutex::new(LogRing::new(LOG_RING_CAPACITY))),
            stop_grace,
        })
    }

    /// Identity of the supervised instance
    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Runner identity (included in registry `start` events)
    #[must_use]
    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// The runner's monitor; launchers add it as a child for aggregation
    #[must_use]
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Current supervision state
    #[must_use]
    pub fn state(&self) -> RunnerState {
        *self.state_tx.borrow()
    }

    /// Watch supervision state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<RunnerState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of the captured child output
    #[must_use]
    pub fn log_snapshot(&self) -> (u64, Vec<LogEntry>) {
        self.log_ring.lock().unwrap().snapshot()
    }

    /// Request a graceful stop of the supervised service
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, state: RunnerState) {
        debug!(service_id = %self.service_id, ?state, "runner state");
        self.state_tx.send_replace(state);
    }

    async fn publish_registry(&self, event: RegistryEvent) {
        let Some(bus) = self.context.bus() else {
            return;
        };
        let subject = subjects::registry(event.kind(), event.service_id());
        match serde_json::to_value(&event) {
            Ok(payload) => {
                if let Err(e) = bus.publish(&subject, &payload).await {
                    warn!(subject, "publish failed: {e}");
                }
            }
            Err(e) => warn!(subject, "failed to encode registry event: {e}"),
        }
    }

    /// Spawn the supervision task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    /// The supervision loop
    pub async fn run(self: Arc<Self>) {
        loop {
            self.set_state(RunnerState::Starting);
            self.monitor.set_status(Status::Startup, "Launching service");

            let exit = match self.launch().await {
                Ok(mut launched) => {
                    self.set_state(RunnerState::Running);
                    self.monitor.set_status(Status::Ok, "Service running");
                    let waited = tokio::select! {
                        exit = self.wait_exit(&mut launched) => Some(exit),
                        _ = self.cancel.cancelled() => None,
                    };
                    match waited {
                        Some(exit) => {
                            self.cleanup_after_exit(launched).await;
                            exit
                        }
                        None => {
                            self.shutdown_launched(launched).await;
                            self.set_state(RunnerState::Stopped);
                            self.monitor.set_status(Status::Ok, "Service stopped");
                            return;
                        }
                    }
                }
                Err(exit) => {
                    // A failed launch counts as an attempt
                    exit
                }
            };

            if exit.is_abnormal() {
                warn!(
                    service_id = %self.service_id,
                    code = ?exit.code,
                    signal = ?exit.signal,
                    "service crashed"
                );
                self.publish_registry(RegistryEvent::Crashed {
                    service_id: self.service_id.clone(),
                    exit_code: exit.code,
                    signal: exit.signal,
                    timestamp: Utc7::now(),
                })
                .await;
                self.set_state(RunnerState::Crashed);
                self.monitor.set_status(Status::Error, "Service crashed");
            } else {
                self.set_state(RunnerState::Exited);
                if exit.is_failure() {
                    self.monitor.set_status(Status::Error, "Service exited with failure");
                } else {
                    self.monitor.set_status(Status::Ok, "Service exited");
                }
            }

            if !wants_restart(self.descriptor.restart, &exit) {
                self.set_state(RunnerState::Stopped);
                return;
            }

            // Restart accounting over the sliding window
            let window = self.descriptor.window();
            let restart_max = self.descriptor.restart_max;
            let within_window = {
                let mut history = self.restart_history.lock().unwrap();
                while history
                    .front()
                    .is_some_and(|t| t.elapsed() > window)
                {
                    history.pop_front();
                }
                history.len() as u32
            };
            if restart_max > 0 && within_window >= restart_max {
                error!(
                    service_id = %self.service_id,
                    restart_max,
                    "restart limit reached, giving up"
                );
                self.publish_registry(RegistryEvent::failed(
                    self.service_id.clone(),
                    "restart_limit",
                    Some(format!(
                        "{within_window} restarts within {}s",
                        self.descriptor.restart_window
                    )),
                ))
                .await;
                self.set_state(RunnerState::GivenUp);
                self.monitor.set_status(Status::Failed, "Restart limit reached");
                return;
            }

            // Back-off; a stop request wins over a pending restart
            tokio::select! {
                _ = tokio::time::sleep(self.descriptor.restart_delay()) => {}
                _ = self.cancel.cancelled() => {
                    self.set_state(RunnerState::Stopped);
                    return;
                }
            }

            self.restart_history.lock().unwrap().push_back(Instant::now());
            let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
            info!(service_id = %self.service_id, attempt, "restarting service");
            self.publish_registry(RegistryEvent::restarting(self.service_id.clone(), attempt))
                .await;
            self.set_state(RunnerState::Restarting);
        }
    }

    async fn launch(&self) -> std::result::Result<Launched, ExitInfo> {
        match self.mode {
            LaunchMode::InProcess => self.launch_in_process().await,
            LaunchMode::Subprocess => self.launch_subprocess(),
        }
    }

    async fn launch_in_process(&self) -> std::result::Result<Launched, ExitInfo> {
        let deps = ControllerDeps {
            descriptor: self.descriptor.clone(),
            resolver: Arc::clone(self.context.config()),
            registry: Arc::clone(self.context.services()),
            bus: self.context.bus(),
            runner_id: Some(self.runner_id.clone()),
            launcher_id: Some(self.launcher_id.clone()),
            parent_name: Some(self.launcher_id.clone()),
            stop_grace: self.stop_grace,
        };
        let controller = ServiceController::new(deps);
        self.context.register_controller(Arc::clone(&controller));

        if let Err(e) = controller.initialize().await {
            error!(service_id = %self.service_id, "initialize failed: {e}");
            controller.shutdown().await;
            self.context.unregister_controller(&self.service_id);
            return Err(ExitInfo::raised());
        }
        if let Err(e) = controller.start().await {
            error!(service_id = %self.service_id, "start failed: {e}");
            controller.shutdown().await;
            self.context.unregister_controller(&self.service_id);
            return Err(ExitInfo::raised());
        }
        Ok(Launched::InProcess { controller })
    }

    fn launch_subprocess(&self) -> std::result::Result<Launched, ExitInfo> {
        let program = match self.resolve_program() {
            Ok(program) => program,
            Err(e) => {
                error!(service_id = %self.service_id, "cannot resolve program: {e}");
                return Err(ExitInfo::spawn_failure());
            }
        };

        let mut args = Vec::new();
        if let Some(config) = &self.config_file {
            args.push(config.display().to_string());
        }
        args.push(self.descriptor.variant.clone());
        args.push("--runner-id".to_string());
        args.push(self.runner_id.clone());
        args.push("--parent-name".to_string());
        args.push(self.launcher_id.clone());

        let mut envs = Vec::new();
        if let Some(level) = &self.descriptor.log_level {
            envs.push(("RUST_LOG".to_string(), level.clone()));
        }
        let mut child = match process::spawn_with_env(&program, &args, &envs) {
            Ok(child) => child,
            Err(e) => {
                error!(service_id = %self.service_id, "spawn failed: {e}");
                return Err(ExitInfo::spawn_failure());
            }
        };
        info!(service_id = %self.service_id, pid = child.pid(), %program, "subprocess started");

        let mut relay = Vec::new();
        if let Some(stdout) = child.take_stdout() {
            relay.push(self.relay_stream(stdout, LogStream::Stdout));
        }
        if let Some(stderr) = child.take_stderr() {
            relay.push(self.relay_stream(stderr, LogStream::Stderr));
        }

        Ok(Launched::Subprocess {
            child,
            relay,
            started: Instant::now(),
        })
    }

    /// Program resolution order: descriptor override, then the registry
    /// mapping, then the conventional internal name
    fn resolve_program(&self) -> Result<String> {
        if let Some(program) = &self.descriptor.module_path {
            return Ok(program.clone());
        }
        self.context
            .config()
            .registry_program(&self.descriptor.service_type)
    }

    fn relay_stream<R>(&self, stream: R, kind: LogStream) -> JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let service_id = self.service_id.clone();
        let ring = Arc::clone(&self.log_ring);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "svc_output", "[{service_id}] {line}");
                ring.lock().unwrap().push(LogEntry::now(kind, line));
            }
        })
    }

    async fn wait_exit(&self, launched: &mut Launched) -> ExitInfo {
        match launched {
            Launched::Subprocess { child, .. } => match child.wait().await {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    error!(service_id = %self.service_id, "wait failed: {e}");
                    ExitInfo::raised()
                }
            },
            Launched::InProcess { controller } => {
                let mut state_rx = controller.subscribe_state();
                loop {
                    if state_rx.borrow_and_update().is_terminal() {
                        break;
                    }
                    if state_rx.changed().await.is_err() {
                        break;
                    }
                }
                let failed = controller.state() == crate::controller::ControllerState::Failed;
                if failed {
                    ExitInfo::raised()
                } else {
                    ExitInfo::clean()
                }
            }
        }
    }

    async fn cleanup_after_exit(&self, launched: Launched) {
        match launched {
            Launched::Subprocess { relay, .. } => {
                for task in relay {
                    let _ = task.await;
                }
            }
            Launched::InProcess { controller } => {
                controller.shutdown().await;
                self.context.unregister_controller(&self.service_id);
            }
        }
    }

    /// Stop a running launch on request, escalating for subprocesses
    async fn shutdown_launched(&self, launched: Launched) {
        match launched {
            Launched::Subprocess {
                mut child,
                relay,
                started,
            } => {
                let pid = child.pid();
                match process::terminate_with_grace(&mut child, self.stop_grace).await {
                    Ok(status) => {
                        let (code, signal) = process::exit_parts(status);
                        if signal == Some(libc::SIGKILL) {
                            // The child had no chance to publish its own
                            // stop event; do it on its behalf.
                            warn!(service_id = %self.service_id, pid, "force-killed subprocess");
                            self.publish_registry(RegistryEvent::stop(
                                self.service_id.clone(),
                                started.elapsed().as_secs_f64(),
                                ExitClass::Crashed,
                                code,
                            ))
                            .await;
                        }
                    }
                    Err(e) => {
                        error!(service_id = %self.service_id, pid, "termination failed: {e}");
                    }
                }
                for task in relay {
                    let _ = task.await;
                }
            }
            Launched::InProcess { controller } => {
                if let Err(e) = controller.stop().await {
                    warn!(service_id = %self.service_id, "stop failed: {e}");
                }
                controller.shutdown().await;
                self.context.unregister_controller(&self.service_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_decisions() {
        let clean = ExitInfo::clean();
        let failed = ExitInfo {
            code: Some(1),
            signal: None,
            raised: false,
            spawn_failed: false,
        };
        let signalled = ExitInfo {
            code: None,
            signal: Some(9),
            raised: false,
            spawn_failed: false,
        };
        let abnormal_code = ExitInfo {
            code: Some(137),
            signal: None,
            raised: false,
            spawn_failed: false,
        };
        let raised = ExitInfo::raised();

        assert!(!wants_restart(RestartPolicy::No, &failed));
        assert!(!wants_restart(RestartPolicy::No, &signalled));

        assert!(!wants_restart(RestartPolicy::OnFailure, &clean));
        assert!(wants_restart(RestartPolicy::OnFailure, &failed));
        assert!(wants_restart(RestartPolicy::OnFailure, &raised));

        assert!(!wants_restart(RestartPolicy::OnAbnormal, &clean));
        assert!(!wants_restart(RestartPolicy::OnAbnormal, &failed));
        assert!(wants_restart(RestartPolicy::OnAbnormal, &signalled));
        assert!(wants_restart(RestartPolicy::OnAbnormal, &abnormal_code));
        assert!(wants_restart(RestartPolicy::OnAbnormal, &raised));

        assert!(wants_restart(RestartPolicy::Always, &clean));
        assert!(wants_restart(RestartPolicy::Always, &failed));
    }

    #[test]
    fn test_spawn_failure_counts_as_failure() {
        let exit = ExitInfo::spawn_failure();
        assert!(exit.is_failure());
        assert!(exit.is_abnormal());
        assert!(wants_restart(RestartPolicy::OnFailure, &exit));
    }
}
