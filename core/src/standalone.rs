//! Standalone service entry
//!
//! Subprocess-mode services are hosted by a binary built around
//! [`run_service`]: the binary registers its service type(s) and hands
//! control to the framework, which parses the standard CLI surface,
//! bootstraps a process context, runs one controller, and waits for a
//! shutdown signal.
//!
//! ```text
//! tcs-svc-<type> [config_file] [variant] [--runner-id ID] [--parent-name NAME]
//! ```
//!
//! Exit codes: `0` normal stop, `1` generic failure, `2` configuration
//! error; deaths by signal surface as `>128` through the OS.

use crate::context::{memory_connector, BusConnector, ContextOptions, ProcessContext};
use crate::controller::{ControllerDeps, ControllerState, ServiceController};
use crate::error::TcsError;
use crate::service::ServiceRegistry;
use clap::Parser;
use schema::ServiceDescriptor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// CLI surface of a standalone service binary
#[derive(Parser, Debug)]
#[command(about = "Run one service instance standalone")]
pub struct ServiceArgs {
    /// Path to the services config file
    #[arg(default_value = "./config/services.yaml")]
    pub config_file: PathBuf,

    /// Instance variant
    #[arg(default_value = "default")]
    pub variant: String,

    /// Runner id assigned by the spawning launcher
    #[arg(long)]
    pub runner_id: Option<String>,

    /// Parent name for display grouping
    #[arg(long)]
    pub parent_name: Option<String>,
}

/// Run one service instance to completion; returns the process exit code
pub async fn service_main(
    service_type: &str,
    registry: Arc<ServiceRegistry>,
    args: ServiceArgs,
    connector: BusConnector,
) -> i32 {
    // A missing config file falls back to an empty configuration; only an
    // unparseable file is fatal.
    let config_file = if args.config_file.exists() {
        Some(args.config_file.clone())
    } else {
        warn!(
            path = %args.config_file.display(),
            "config file not found, continuing with empty configuration"
        );
        None
    };

    let opts = ContextOptions {
        config_file,
        services: registry,
        ..Default::default()
    };
    let context = match ProcessContext::initialize(opts, connector).await {
        Ok(context) => context,
        Err(e) => {
            error!("bootstrap failed: {e}");
            return e.exit_code();
        }
    };

    let descriptor = ServiceDescriptor::new(service_type, args.variant.clone());
    if let Err(e) = descriptor.validate() {
        error!("invalid instance identity: {e}");
        return TcsError::Config(e).exit_code();
    }

    let deps = ControllerDeps {
        descriptor,
        resolver: Arc::clone(context.config()),
        registry: Arc::clone(context.services()),
        bus: context.bus(),
        runner_id: args.runner_id.clone(),
        launcher_id: None,
        parent_name: args.parent_name.clone(),
        stop_grace: crate::controller::DEFAULT_STOP_GRACE,
    };
    let controller = ServiceController::new(deps);
    context.register_controller(Arc::clone(&controller));

    let code = drive(&controller).await;

    context.shutdown().await;
    code
}

async fn drive(controller: &Arc<ServiceController>) -> i32 {
    if let Err(e) = controller.initialize().await {
        error!("initialization failed: {e}");
        return e.exit_code();
    }
    if let Err(e) = controller.start().await {
        error!("start failed: {e}");
        return e.exit_code();
    }
    info!(
        service_id = controller.service_id(),
        "service running, waiting for shutdown signal"
    );

    let mut state_rx = controller.subscribe_state();
    let service_done = async {
        loop {
            if state_rx.borrow_and_update().is_terminal() {
                break;
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            if let Err(e) = controller.stop().await {
                error!("stop failed: {e}");
                return e.exit_code();
            }
        }
        // Single-shot services (and crashed loops) finish on their own
        _ = service_done => {}
    }

    match controller.state() {
        ControllerState::Stopped => 0,
        _ => 1,
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            // Fall back to Ctrl+C alone
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

/// Blocking entry point for a standalone service binary
///
/// Parses the CLI, sets up logging and a runtime, runs the service with
/// the in-process bus binding, and exits the process.
pub fn run_service(service_type: &str, registry: Arc<ServiceRegistry>) -> ! {
    let args = ServiceArgs::parse();
    crate::utils::init_tracing("info");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(service_main(
        service_type,
        registry,
        args,
        memory_connector(),
    ));
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceContext, ServiceInstance, SingleShotService};
    use async_trait::async_trait;

    struct Quick;

    #[async_trait]
    impl SingleShotService for Quick {
        async fn execute(&mut self, _ctx: &ServiceContext) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct Exploding;

    #[async_trait]
    impl SingleShotService for Exploding {
        async fn execute(&mut self, _ctx: &ServiceContext) -> crate::error::Result<()> {
            Err(TcsError::Runtime("kaboom".to_string()))
        }
    }

    fn args(variant: &str) -> ServiceArgs {
        ServiceArgs {
            config_file: PathBuf::from("/nonexistent/services.yaml"),
            variant: variant.to_string(),
            runner_id: None,
            parent_name: None,
        }
    }

    #[tokio::test]
    async fn test_single_shot_exits_zero() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register("quick", || ServiceInstance::SingleShot(Box::new(Quick)));
        let code = service_main("quick", registry, args("t1"), memory_connector()).await;
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_failing_single_shot_exits_one() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register("bad", || ServiceInstance::SingleShot(Box::new(Exploding)));
        let code = service_main("bad", registry, args("t1"), memory_connector()).await;
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn test_unregistered_type_exits_one() {
        let registry = Arc::new(ServiceRegistry::new());
        let code = service_main("ghost", registry, args("t1"), memory_connector()).await;
        assert_eq!(code, 1);
    }

    #[test]
    fn test_cli_defaults() {
        let parsed = ServiceArgs::parse_from(["svc"]);
        assert_eq!(parsed.config_file, PathBuf::from("./config/services.yaml"));
        assert_eq!(parsed.variant, "default");
        assert!(parsed.runner_id.is_none());

        let parsed =
            ServiceArgs::parse_from(["svc", "conf.yaml", "t1", "--runner-id", "r1"]);
        assert_eq!(parsed.config_file, PathBuf::from("conf.yaml"));
        assert_eq!(parsed.variant, "t1");
        assert_eq!(parsed.runner_id.as_deref(), Some("r1"));
    }
}
