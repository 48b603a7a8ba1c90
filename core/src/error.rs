//! Framework error taxonomy
//!
//! Error kinds map one-to-one onto the failure classes of the supervision
//! design: configuration problems are fatal at startup (exit code 2 and no
//! bus publish, the bus may not exist yet); everything else surfaces as a
//! status/registry observation and, where a supervisor is attached, as a
//! restart decision.

use thiserror::Error;

/// Framework-level error kinds
#[derive(Error, Debug)]
pub enum TcsError {
    /// Unresolvable configuration; fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Requested service type has no registry entry
    #[error("service discovery error: {0}")]
    Discovery(String),

    /// Service start hook raised
    #[error("service startup failed: {0}")]
    Startup(String),

    /// Error inside a running service
    #[error("service runtime error: {0}")]
    Runtime(String),

    /// Service stop hook raised
    #[error("service shutdown failed: {0}")]
    Shutdown(String),

    /// Bus transport failure; non-fatal for callers
    #[error("bus error: {0}")]
    Bus(#[from] bus::BusError),

    /// Process spawn/signal/wait failure
    #[error("process error: {0}")]
    Process(String),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl TcsError {
    /// Exit code for a process terminating with this error
    ///
    /// `2` for configuration errors, `1` for everything else; signal deaths
    /// (`>128`) are produced by the OS, not by this mapping.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            TcsError::Config(_) => 2,
            _ => 1,
        }
    }
}

impl From<String> for TcsError {
    fn from(s: String) -> Self {
        TcsError::Other(s)
    }
}

impl From<&str> for TcsError {
    fn from(s: &str) -> Self {
        TcsError::Other(s.to_string())
    }
}

/// Framework result type
pub type Result<T> = std::result::Result<T, TcsError>;
