//! Bus capability for the TCS supervision framework
//!
//! The framework never talks to a concrete message broker; it consumes the
//! [`Bus`] trait defined here. A production deployment binds it to a
//! JetStream-style broker (persistent pub/sub plus core request/response);
//! tests and the in-process launcher mode use the bundled [`MemoryBus`].
//!
//! The capability covers:
//! - fire-and-forget publish of JSON payloads
//! - live subscriptions with NATS-style subject wildcards (`*`, `>`)
//! - history replay of retained subjects (warm start for discovery)
//! - request/response with a timeout
//! - serving request/response handlers (RPC responders)
//!
//! Retention is a property of the subject family, not of the publisher; the
//! three tiers used by the protocol are described by [`StreamPolicy`].

pub mod memory;
pub mod subjects;

pub use memory::MemoryBus;
pub use subjects::{subject_matches, StreamPolicy};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Bus transport errors
#[derive(thiserror::Error, Debug)]
pub enum BusError {
    /// The bus connection is closed
    #[error("bus is closed")]
    Closed,

    /// Publishing failed
    #[error("publish failed: {0}")]
    Publish(String),

    /// Creating a subscription failed
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// A request did not receive a response in time
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// No responder is serving the requested subject
    #[error("no responder for subject '{0}'")]
    NoResponder(String),

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(String),
}

/// Bus-specific result type
pub type Result<T> = std::result::Result<T, BusError>;

/// A message as seen by subscribers
#[derive(Debug, Clone)]
pub struct Message {
    /// Full subject the message was published on
    pub subject: String,
    /// JSON payload
    pub payload: Value,
}

/// Stream of messages delivered to one subscriber
///
/// Dropping the subscription releases the underlying resources.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// Wrap a receiver into a subscription
    #[must_use]
    pub fn new(rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { rx }
    }

    /// Await the next message; `None` when the bus side is gone
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Non-blocking poll used by tests and drain loops
    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// Handler invoked for each request arriving on a served subject
pub type RpcHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, Value> + Send + Sync>;

/// Abstract message-bus capability
///
/// Implementations must serialize their own writes; `publish` may be called
/// concurrently from every monitor and controller sharing the connection.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload on a subject
    async fn publish(&self, subject: &str, payload: &Value) -> Result<()>;

    /// Subscribe to all subjects matching `filter` (supports `*` and `>`)
    async fn subscribe(&self, filter: &str) -> Result<Subscription>;

    /// Replay the retained history of subjects matching `filter`, oldest
    /// first. Only subject families with a retention tier keep history.
    async fn history(&self, filter: &str) -> Result<Vec<Message>>;

    /// Send a request and await a single response
    async fn request(&self, subject: &str, payload: &Value, timeout: Duration) -> Result<Value>;

    /// Serve request/response on all subjects matching `filter`
    async fn serve(&self, filter: &str, handler: RpcHandler) -> Result<()>;

    /// Flush any buffered writes
    async fn flush(&self) -> Result<()>;

    /// Close the connection; subsequent publishes fail with [`BusError::Closed`]
    async fn close(&self) -> Result<()>;
}
