//! Health status model
//!
//! This module defines the status levels used throughout the supervision
//! system, their total order, and the worst-wins aggregation over it.
//!
//! ## Ordering
//!
//! Statuses are totally ordered from least to most severe:
//!
//! ```text
//! Unknown < Ok < Idle < Busy < Startup < Shutdown
//!         < Warning < Degraded < Error < Failed
//! ```
//!
//! The transitional states `Startup`/`Shutdown` rank below the error states
//! and `Failed` is the worst. [`aggregate`] is the only place the ordering
//! is consulted for health decisions; every comparison elsewhere goes
//! through it.

use crate::time::Utc7;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Health level of a service or monitored component
///
/// The derived `Ord` follows declaration order, which encodes the
/// worst-wins severity ranking used by [`aggregate`].
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    JsonSchema,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// No information available yet
    Unknown,
    /// Operating normally
    Ok,
    /// Task tracking active, no work in flight
    Idle,
    /// Task tracking active, work in flight
    Busy,
    /// Starting up
    Startup,
    /// Shutting down
    Shutdown,
    /// Operational with a noteworthy condition
    Warning,
    /// Operational with reduced capability
    Degraded,
    /// A failure occurred; the component keeps running
    Error,
    /// The component is not functional
    Failed,
}

impl Status {
    /// Check if the status indicates a healthy, working component
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(
            self,
            Status::Ok | Status::Idle | Status::Busy | Status::Warning | Status::Degraded
        )
    }

    /// Check if the component is operational (healthy or starting up)
    #[must_use]
    pub fn is_operational(&self) -> bool {
        self.is_healthy() || matches!(self, Status::Startup)
    }

    /// Check if the status belongs to the manually recoverable error set
    ///
    /// These are the statuses that `cancel_error_status` reverts.
    #[must_use]
    pub fn is_error_like(&self) -> bool {
        matches!(self, Status::Error | Status::Degraded | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Unknown => "unknown",
            Status::Ok => "ok",
            Status::Idle => "idle",
            Status::Busy => "busy",
            Status::Startup => "startup",
            Status::Shutdown => "shutdown",
            Status::Warning => "warning",
            Status::Degraded => "degraded",
            Status::Error => "error",
            Status::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Unknown
    }
}

/// Worst-wins aggregation over the status total order
///
/// Returns the maximum of the given statuses, or [`Status::Unknown`] for an
/// empty input. Aggregation over a monitor tree is recursive: a node's
/// effective status is the aggregate of its own status and the effective
/// statuses of all children.
#[must_use]
pub fn aggregate<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    statuses.into_iter().max().unwrap_or(Status::Unknown)
}

/// Point-in-time status record for a monitored component
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StatusReport {
    /// Status level
    pub status: Status,

    /// Human-readable explanation of the status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the report was produced (UTC)
    pub timestamp: Utc7,

    /// Metrics collected at report time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Map<String, Value>>,
}

impl StatusReport {
    /// Create a report stamped with the current time
    #[must_use]
    pub fn new(status: Status, message: Option<String>) -> Self {
        Self {
            status,
            message,
            timestamp: Utc7::now(),
            metrics: None,
        }
    }
}
