//! Service descriptors and restart policies
//!
//! A [`ServiceDescriptor`] is one entry of the launcher's `services` list:
//! the service type, the instance variant, the restart policy knobs and any
//! service-specific fields. Its identity on the bus is
//! `"{service_type}.{variant}"`; the variant must not contain dots so the
//! identity stays parseable inside subject names.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Restart policy for a supervised service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart
    No,
    /// Restart when the exit was a failure (non-zero exit code, or a raised
    /// error for in-process services)
    OnFailure,
    /// Restart only on abnormal termination: exit code > 128 or death by
    /// signal (in-process services map this to unexpected errors)
    OnAbnormal,
    /// Restart on every exit
    Always,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::No
    }
}

const fn default_restart_sec() -> f64 {
    5.0
}

const fn default_restart_window() -> f64 {
    60.0
}

fn default_variant() -> String {
    "default".to_string()
}

const fn default_enabled() -> bool {
    true
}

/// One configured service instance
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServiceDescriptor {
    /// Service type; may be dot-namespaced (`guiding.ofp`)
    #[serde(rename = "type")]
    pub service_type: String,

    /// Instance identifier within the type; must not contain dots.
    /// `instance_context` is accepted as a deprecated synonym.
    #[serde(default = "default_variant", alias = "instance_context")]
    pub variant: String,

    /// Executable hosting the service in subprocess mode.
    /// `None` selects the conventional fallback for the type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_path: Option<String>,

    /// Disabled services are declared to the registry but never started
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Restart policy (default `no`)
    #[serde(default)]
    pub restart: RestartPolicy,

    /// Back-off before a restart attempt, in seconds (default 5.0)
    #[serde(default = "default_restart_sec")]
    pub restart_sec: f64,

    /// Maximum restarts within the window; 0 means unbounded (default 0)
    #[serde(default)]
    pub restart_max: u32,

    /// Sliding window for restart accounting, in seconds (default 60.0)
    #[serde(default = "default_restart_window")]
    pub restart_window: f64,

    /// Log level override for the service process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Arbitrary service-specific configuration fields
    #[serde(flatten)]
    pub config_fields: Map<String, Value>,
}

impl ServiceDescriptor {
    /// Create a descriptor with default options
    #[must_use]
    pub fn new(service_type: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            variant: variant.into(),
            module_path: None,
            enabled: true,
            restart: RestartPolicy::default(),
            restart_sec: default_restart_sec(),
            restart_max: 0,
            restart_window: default_restart_window(),
            log_level: None,
            config_fields: Map::new(),
        }
    }

    /// Bus identity of the instance: `"{service_type}.{variant}"`
    #[must_use]
    pub fn service_id(&self) -> String {
        format!("{}.{}", self.service_type, self.variant)
    }

    /// Back-off before a restart attempt as a `Duration`
    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs_f64(self.restart_sec.max(0.0))
    }

    /// Restart accounting window as a `Duration`
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.restart_window.max(0.0))
    }

    /// Validate the identity and restart invariants
    ///
    /// The type must be non-empty and the variant must be non-empty and
    /// dot-free; the type itself may be dot-namespaced.
    pub fn validate(&self) -> Result<(), String> {
        if self.service_type.trim().is_empty() {
            return Err("service type cannot be empty".to_string());
        }
        if self.variant.trim().is_empty() {
            return Err(format!(
                "service '{}': variant cannot be empty",
                self.service_type
            ));
        }
        if self.variant.contains('.') {
            return Err(format!(
                "service '{}': variant '{}' must not contain '.'",
                self.service_type, self.variant
            ));
        }
        if self.restart_sec < 0.0 {
            return Err(format!(
                "service '{}': restart_sec must be >= 0",
                self.service_id()
            ));
        }
        if self.restart_window <= 0.0 {
            return Err(format!(
                "service '{}': restart_window must be > 0",
                self.service_id()
            ));
        }
        Ok(())
    }
}
