//! tcsd, the launcher daemon for telescope-control services
//!
//! Reads the service configuration, declares every configured instance to
//! the registry stream, and supervises the enabled ones either
//! cooperatively in this process or as subprocesses. SIGINT and SIGTERM
//! both trigger a graceful shutdown with a grace window, then force-exit.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tcs_core::context::{memory_connector, ContextOptions, ProcessContext};
use tcs_core::launcher::{LaunchMode, Launcher};
use tcs_core::service::ServiceRegistry;
use tracing::{error, info};

/// Extra slack on top of the per-service stop grace before force-exit
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(12);

#[derive(Parser, Debug)]
#[command(name = "tcsd", about = "Launcher for telescope-control services")]
struct Args {
    /// Path to the services config file
    #[arg(long)]
    config: PathBuf,

    /// How services are hosted
    #[arg(long, value_enum, default_value = "in-process")]
    mode: Mode,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// All services cooperatively in this process
    InProcess,
    /// Each service in its own subprocess
    Subprocess,
}

impl From<Mode> for LaunchMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::InProcess => LaunchMode::InProcess,
            Mode::Subprocess => LaunchMode::Subprocess,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    tcs_core::utils::init_tracing("info");

    // An explicitly given config file must exist
    if !args.config.exists() {
        eprintln!("configuration file not found: {}", args.config.display());
        std::process::exit(2);
    }

    let registry = Arc::new(ServiceRegistry::new());
    tcsd::services::register_builtin(&registry);

    let opts = ContextOptions {
        config_file: Some(args.config.clone()),
        services: registry,
        ..Default::default()
    };
    let context = match ProcessContext::initialize(opts, memory_connector()).await {
        Ok(context) => context,
        Err(e) => {
            eprintln!("bootstrap failed: {e}");
            std::process::exit(e.exit_code());
        }
    };

    let launcher = match Launcher::new(Arc::clone(&context), args.mode.into()) {
        Ok(launcher) => launcher,
        Err(e) => {
            eprintln!("launcher setup failed: {e}");
            std::process::exit(e.exit_code());
        }
    };
    if let Err(e) = launcher.start().await {
        error!("launcher start failed: {e}");
        std::process::exit(e.exit_code());
    }

    info!("services started, waiting for shutdown signal");
    shutdown_signal().await;
    info!("shutdown signal received");

    let graceful = async {
        launcher.shutdown().await;
        context.shutdown().await;
    };
    tokio::select! {
        () = graceful => {
            info!("launcher stopped");
        }
        () = tokio::time::sleep(SHUTDOWN_DEADLINE) => {
            error!("graceful shutdown timed out, forcing exit");
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
