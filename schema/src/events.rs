//! Wire payloads of the supervision protocol
//!
//! Three event classes travel over three subject families:
//!
//! - **Registry events** (`svc.registry.<event>.<service_id>`): lifecycle
//!   transitions, retained indefinitely with a per-subject message cap.
//!   Required order per instance: `declared → start → ready → … →
//!   stopping → stop`; the supervisor may interleave `crashed`,
//!   `restarting` and `failed` while handling restart decisions.
//! - **Status events** (`svc.status.<service_id>`): the effective status
//!   with a children summary, retained for a bounded age.
//! - **Heartbeats** (`svc.heartbeat.<service_id>`): periodic liveness with
//!   a monotonic sequence, short retention.
//!
//! All timestamps are UTC 7-tuples ([`Utc7`]). Events are designed to be
//! replayed from persistent streams, so every payload is self-contained.

use crate::status::Status;
use crate::time::Utc7;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Classification of a service stop
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExitClass {
    /// Stop hook completed without error
    Clean,
    /// Service raised during run or stop
    Failed,
    /// Process died without a proper stop sequence
    Crashed,
}

/// Lifecycle events published on the registry subject family
///
/// The wire representation is tagged by an `event` field carrying the
/// lowercase event name, which is also the subject token
/// (`svc.registry.<event>.<service_id>`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// Instance is part of the configuration; emitted by the launcher for
    /// every configured service (disabled ones included) before any start
    Declared {
        /// Service identity `"{type}.{variant}"`
        service_id: String,
        /// Service type
        service_type: String,
        /// Instance variant
        variant: String,
        /// Launcher that declared the instance
        #[serde(default, skip_serializing_if = "Option::is_none")]
        launcher_id: Option<String>,
        /// Whether the instance will be started
        enabled: bool,
        /// Event time (UTC)
        timestamp: Utc7,
    },

    /// Controller began initializing the instance
    Start {
        /// Service identity
        service_id: String,
        /// Runner supervising the instance, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        runner_id: Option<String>,
        /// Launcher owning the runner, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        launcher_id: Option<String>,
        /// Host the instance runs on
        host: String,
        /// OS process id hosting the instance
        pid: u32,
        /// Event time (UTC)
        timestamp: Utc7,
    },

    /// Service start hook completed; the instance is serving
    Ready {
        /// Service identity
        service_id: String,
        /// Event time (UTC)
        timestamp: Utc7,
    },

    /// Graceful stop began
    Stopping {
        /// Service identity
        service_id: String,
        /// Event time (UTC)
        timestamp: Utc7,
    },

    /// Instance stopped
    Stop {
        /// Service identity
        service_id: String,
        /// Seconds the instance was up
        uptime_sec: f64,
        /// How the stop is classified
        exit: ExitClass,
        /// Exit code for subprocess instances
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        /// Event time (UTC)
        timestamp: Utc7,
    },

    /// Supervisor detected an abnormal death
    Crashed {
        /// Service identity
        service_id: String,
        /// Exit code, if the process exited
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        /// Signal that killed the process, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
        /// Event time (UTC)
        timestamp: Utc7,
    },

    /// Supervisor is about to relaunch the instance
    Restarting {
        /// Service identity
        service_id: String,
        /// Restart attempt number (1-indexed)
        attempt: u32,
        /// Event time (UTC)
        timestamp: Utc7,
    },

    /// Instance failed terminally (startup failure or restart limit)
    Failed {
        /// Service identity
        service_id: String,
        /// Machine-readable reason (`startup`, `restart_limit`, …)
        reason: String,
        /// Human-readable detail
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Event time (UTC)
        timestamp: Utc7,
    },
}

impl RegistryEvent {
    /// Event name as used in the subject token
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Declared { .. } => "declared",
            Self::Start { .. } => "start",
            Self::Ready { .. } => "ready",
            Self::Stopping { .. } => "stopping",
            Self::Stop { .. } => "stop",
            Self::Crashed { .. } => "crashed",
            Self::Restarting { .. } => "restarting",
            Self::Failed { .. } => "failed",
        }
    }

    /// Service identity the event refers to
    #[must_use]
    pub fn service_id(&self) -> &str {
        match self {
            Self::Declared { service_id, .. }
            | Self::Start { service_id, .. }
            | Self::Ready { service_id, .. }
            | Self::Stopping { service_id, .. }
            | Self::Stop { service_id, .. }
            | Self::Crashed { service_id, .. }
            | Self::Restarting { service_id, .. }
            | Self::Failed { service_id, .. } => service_id,
        }
    }

    /// Event timestamp
    #[must_use]
    pub fn timestamp(&self) -> Utc7 {
        match self {
            Self::Declared { timestamp, .. }
            | Self::Start { timestamp, .. }
            | Self::Ready { timestamp, .. }
            | Self::Stopping { timestamp, .. }
            | Self::Stop { timestamp, .. }
            | Self::Crashed { timestamp, .. }
            | Self::Restarting { timestamp, .. }
            | Self::Failed { timestamp, .. } => *timestamp,
        }
    }

    /// Create a `ready` event stamped now
    #[must_use]
    pub fn ready(service_id: impl Into<String>) -> Self {
        Self::Ready {
            service_id: service_id.into(),
            timestamp: Utc7::now(),
        }
    }

    /// Create a `stopping` event stamped now
    #[must_use]
    pub fn stopping(service_id: impl Into<String>) -> Self {
        Self::Stopping {
            service_id: service_id.into(),
            timestamp: Utc7::now(),
        }
    }

    /// Create a `stop` event stamped now
    #[must_use]
    pub fn stop(
        service_id: impl Into<String>,
        uptime_sec: f64,
        exit: ExitClass,
        exit_code: Option<i32>,
    ) -> Self {
        Self::Stop {
            service_id: service_id.into(),
            uptime_sec,
            exit,
            exit_code,
            timestamp: Utc7::now(),
        }
    }

    /// Create a `restarting` event stamped now
    #[must_use]
    pub fn restarting(service_id: impl Into<String>, attempt: u32) -> Self {
        Self::Restarting {
            service_id: service_id.into(),
            attempt,
            timestamp: Utc7::now(),
        }
    }

    /// Create a `failed` event stamped now
    #[must_use]
    pub fn failed(
        service_id: impl Into<String>,
        reason: impl Into<String>,
        message: Option<String>,
    ) -> Self {
        Self::Failed {
            service_id: service_id.into(),
            reason: reason.into(),
            message,
            timestamp: Utc7::now(),
        }
    }
}

/// One child entry inside a published status
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ChildStatus {
    /// Child monitor name
    pub name: String,
    /// Child effective status
    pub status: Status,
    /// Child status message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Status event payload (`svc.status.<service_id>`)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StatusPayload {
    /// Monitor name (the service identity for root monitors)
    pub name: String,

    /// Effective (aggregated) status
    pub status: Status,

    /// Status message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Publish time (UTC)
    pub timestamp: Utc7,

    /// Own status of the monitor when it differs from the effective one
    /// (i.e. when children contribute to the aggregate)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_status: Option<Status>,

    /// Summaries of the direct children
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildStatus>,

    /// Metrics selected for publication
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metrics: Map<String, Value>,
}

/// Heartbeat payload (`svc.heartbeat.<service_id>`)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HeartbeatPayload {
    /// Service identity
    pub service_id: String,

    /// Monotonic sequence; resets only when the instance starts anew
    pub sequence: u64,

    /// Seconds since the instance started
    pub uptime_sec: f64,

    /// Effective status at publish time
    pub status: Status,

    /// Publish time (UTC)
    pub timestamp: Utc7,

    /// When the next heartbeat is due (`timestamp + period`); observers use
    /// this for zombie detection
    pub next_heartbeat_expected: Utc7,

    /// Lightweight metrics
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metrics: Map<String, Value>,
}
