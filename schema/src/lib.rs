//! Schema definitions for the TCS supervision framework
//!
//! This crate contains the shared data structures used across the whole
//! framework: the supervision core, the bus protocol, and any observer of
//! the protocol. All types implement JSON Schema generation for external
//! consumption.
//!
//! Contents:
//! - Health statuses with their total order and worst-wins aggregation
//! - Status reports and the UTC 7-tuple wire timestamp
//! - Service descriptors with restart policies
//! - Registry, status and heartbeat wire payloads
//!
//! Everything here is pure data: serializable, comparable, and free of any
//! runtime or transport dependency.

pub mod descriptor;
pub mod events;
pub mod status;
pub mod time;

pub use descriptor::{RestartPolicy, ServiceDescriptor};
pub use events::{ChildStatus, ExitClass, HeartbeatPayload, RegistryEvent, StatusPayload};
pub use status::{aggregate, Status, StatusReport};
pub use time::Utc7;
