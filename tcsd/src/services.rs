//! Demo services
//!
//! Small services used for end-to-end exercise of the framework: a
//! periodic greeter (blocking-loop shape) and a one-time greeter
//! (single-shot shape).

use async_trait::async_trait;
use tcs_core::config::{ConfigSchema, FieldKind};
use tcs_core::error::Result;
use tcs_core::service::{
    BlockingService, ServiceContext, ServiceInstance, ServiceRegistry, SingleShotService,
};
use tracing::info;

/// Periodic greeter with a configurable period
#[derive(Default)]
pub struct HelloService {
    period_sec: f64,
    count: u64,
}

#[async_trait]
impl BlockingService for HelloService {
    async fn on_start(&mut self, ctx: &ServiceContext) -> Result<()> {
        self.period_sec = ctx.config.get_f64("period").unwrap_or(5.0);
        info!(service_id = %ctx.service_id, period = self.period_sec, "hello service starting");
        Ok(())
    }

    async fn run(&mut self, ctx: &ServiceContext) -> Result<()> {
        loop {
            {
                let _work = ctx.monitor.track_task();
                self.count += 1;
                info!(service_id = %ctx.service_id, "hello #{}", self.count);
            }
            tokio::time::sleep(std::time::Duration::from_secs_f64(self.period_sec)).await;
        }
    }

    async fn on_stop(&mut self, ctx: &ServiceContext) -> Result<()> {
        info!(service_id = %ctx.service_id, greeted = self.count, "hello service stopping");
        Ok(())
    }
}

/// One-time greeter
#[derive(Default)]
pub struct HelloOnceService;

#[async_trait]
impl SingleShotService for HelloOnceService {
    async fn execute(&mut self, ctx: &ServiceContext) -> Result<()> {
        info!(service_id = %ctx.service_id, "hello, once");
        Ok(())
    }
}

/// Register the built-in service types
pub fn register_builtin(registry: &ServiceRegistry) {
    registry.register_with_schema(
        "hello",
        ConfigSchema::new().field("period", FieldKind::Float, serde_json::json!(5.0)),
        || ServiceInstance::Blocking(Box::<HelloService>::default()),
    );
    registry.register("hello_once", || {
        ServiceInstance::SingleShot(Box::<HelloOnceService>::default())
    });
}
