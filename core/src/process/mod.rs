//! Process management for subprocess-mode service instances
//!
//! Platform-specific implementations of safe process spawning, signalling
//! and cleanup. Only Unix is supported: children are placed in their own
//! process group so the whole service tree can be terminated reliably,
//! with TERM→KILL escalation.

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::*;
