//! Standalone host for the `hello` service
//!
//! Spawned by the launcher in subprocess mode (the conventional program
//! name for the `hello` type), or run by hand:
//!
//! ```text
//! tcs-svc-hello [config_file] [variant] [--runner-id ID] [--parent-name NAME]
//! ```

use std::sync::Arc;
use tcs_core::service::ServiceRegistry;

fn main() {
    let registry = Arc::new(ServiceRegistry::new());
    tcsd::services::register_builtin(&registry);
    tcs_core::standalone::run_service("hello", registry);
}
