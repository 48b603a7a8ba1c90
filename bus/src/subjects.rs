//! Subject grammar and retention tiers of the supervision protocol
//!
//! Subjects are dot-separated tokens under the `svc` prefix:
//!
//! ```text
//! svc.registry.<event>.<service_id>   lifecycle events
//! svc.status.<service_id>             status reports
//! svc.heartbeat.<service_id>          liveness
//! svc.rpc.<service_id>.v1.<command>   request/response (not retained)
//! svc.config.v1.get                   bootstrap config request
//! ```
//!
//! `service_id` is itself dot-namespaced (`{type}.{variant}`), which is why
//! the wildcard filters below use `>` rather than `*`.

use std::time::Duration;

/// Subject prefix of the whole protocol surface
pub const PREFIX: &str = "svc";

/// Filter matching every registry event
pub const REGISTRY_ALL: &str = "svc.registry.>";

/// Filter matching every status report
pub const STATUS_ALL: &str = "svc.status.>";

/// Filter matching every heartbeat
pub const HEARTBEAT_ALL: &str = "svc.heartbeat.>";

/// Subject on which a configuration provider may answer bootstrap requests
pub const CONFIG_REQUEST: &str = "svc.config.v1.get";

/// Registry subject for one event of one instance
#[must_use]
pub fn registry(event: &str, service_id: &str) -> String {
    format!("{PREFIX}.registry.{event}.{service_id}")
}

/// Status subject of one instance
#[must_use]
pub fn status(service_id: &str) -> String {
    format!("{PREFIX}.status.{service_id}")
}

/// Heartbeat subject of one instance
#[must_use]
pub fn heartbeat(service_id: &str) -> String {
    format!("{PREFIX}.heartbeat.{service_id}")
}

/// RPC subject for one command of one instance (v1 command namespace)
#[must_use]
pub fn rpc(service_id: &str, command: &str) -> String {
    format!("{PREFIX}.rpc.{service_id}.v1.{command}")
}

/// Filter matching every v1 RPC command of one instance
#[must_use]
pub fn rpc_all(service_id: &str) -> String {
    format!("{PREFIX}.rpc.{service_id}.v1.>")
}

/// Extract the command from an RPC subject (the part after `v1.`)
#[must_use]
pub fn rpc_command(subject: &str) -> Option<&str> {
    let (_, rest) = subject.split_once(".v1.")?;
    (!rest.is_empty()).then_some(rest)
}

/// Match a subject against a NATS-style filter
///
/// `*` matches exactly one token; `>` matches one or more trailing tokens.
#[must_use]
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Retention policy of one subject family
///
/// The protocol uses three persistence tiers; the numbers here are the
/// defaults and may be overridden when provisioning the concrete bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPolicy {
    /// Stream name
    pub name: &'static str,
    /// Subject filter the stream captures
    pub filter: &'static str,
    /// Drop messages older than this
    pub max_age: Option<Duration>,
    /// Keep at most this many messages per subject
    pub max_msgs_per_subject: Option<usize>,
}

impl StreamPolicy {
    /// Registry tier: unbounded age, capped per subject
    #[must_use]
    pub fn registry() -> Self {
        Self {
            name: "svc-registry",
            filter: REGISTRY_ALL,
            max_age: None,
            max_msgs_per_subject: Some(1000),
        }
    }

    /// Status tier: bounded age (~30 days)
    #[must_use]
    pub fn status() -> Self {
        Self {
            name: "svc-status",
            filter: STATUS_ALL,
            max_age: Some(Duration::from_secs(30 * 24 * 3600)),
            max_msgs_per_subject: None,
        }
    }

    /// Heartbeat tier: short retention (~1 day)
    #[must_use]
    pub fn heartbeat() -> Self {
        Self {
            name: "svc-heartbeat",
            filter: HEARTBEAT_ALL,
            max_age: Some(Duration::from_secs(24 * 3600)),
            max_msgs_per_subject: None,
        }
    }

    /// The three tiers used by the protocol
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![Self::registry(), Self::status(), Self::heartbeat()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_builders() {
        assert_eq!(registry("start", "echo.t1"), "svc.registry.start.echo.t1");
        assert_eq!(status("echo.t1"), "svc.status.echo.t1");
        assert_eq!(heartbeat("echo.t1"), "svc.heartbeat.echo.t1");
        assert_eq!(rpc("echo.t1", "health"), "svc.rpc.echo.t1.v1.health");
    }

    #[test]
    fn test_rpc_command_extraction() {
        assert_eq!(rpc_command("svc.rpc.echo.t1.v1.health"), Some("health"));
        assert_eq!(
            rpc_command("svc.rpc.launcher.obs1.v1.start.echo.t1"),
            Some("start.echo.t1")
        );
        assert_eq!(rpc_command("svc.status.echo.t1"), None);
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(subject_matches("svc.registry.>", "svc.registry.start.echo.t1"));
        assert!(subject_matches("svc.status.>", "svc.status.echo.t1"));
        assert!(!subject_matches("svc.status.>", "svc.heartbeat.echo.t1"));
        assert!(subject_matches("svc.status.echo.t1", "svc.status.echo.t1"));
        assert!(subject_matches("svc.*.echo", "svc.status.echo"));
        assert!(!subject_matches("svc.*.echo", "svc.status.echo.t1"));
        // `>` needs at least one token to consume
        assert!(!subject_matches("svc.registry.>", "svc.registry"));
    }

    #[test]
    fn test_default_tiers() {
        let tiers = StreamPolicy::defaults();
        assert_eq!(tiers.len(), 3);
        assert!(tiers[0].max_age.is_none());
        assert_eq!(tiers[0].max_msgs_per_subject, Some(1000));
        assert!(tiers[1].max_age.unwrap() > tiers[2].max_age.unwrap());
    }
}
