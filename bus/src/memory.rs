//! In-process bus implementation
//!
//! [`MemoryBus`] implements the [`Bus`] capability on top of a tokio
//! broadcast channel plus a retained-message store that honours the
//! protocol's three retention tiers. It backs the test suite and the
//! launcher's in-process mode; it is not a network transport.

use crate::subjects::{subject_matches, StreamPolicy};
use crate::{Bus, BusError, Message, Result, RpcHandler, Subscription};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

/// Capacity of the live fan-out channel
const LIVE_CAPACITY: usize = 1024;

struct Retained {
    msg: Message,
    at: Instant,
}

struct Responder {
    filter: String,
    handler: RpcHandler,
}

struct Inner {
    policies: Vec<StreamPolicy>,
    live: broadcast::Sender<Message>,
    store: Mutex<Vec<Retained>>,
    responders: Mutex<Vec<Responder>>,
    closed: AtomicBool,
}

/// Retention-aware in-process bus
///
/// Cloning shares the underlying store, so every clone sees the same
/// subjects, history and responders.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Create a bus with the protocol's default retention tiers
    #[must_use]
    pub fn new() -> Self {
        Self::with_policies(StreamPolicy::defaults())
    }

    /// Create a bus with custom retention tiers
    #[must_use]
    pub fn with_policies(policies: Vec<StreamPolicy>) -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                policies,
                live,
                store: Mutex::new(Vec::new()),
                responders: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of retained messages (all tiers)
    #[must_use]
    pub fn retained_len(&self) -> usize {
        self.inner.store.lock().unwrap().len()
    }

    fn retain(&self, msg: &Message) {
        let Some(policy) = self
            .inner
            .policies
            .iter()
            .find(|p| subject_matches(p.filter, &msg.subject))
        else {
            return;
        };

        let mut store = self.inner.store.lock().unwrap();
        store.push(Retained {
            msg: msg.clone(),
            at: Instant::now(),
        });

        if let Some(max_age) = policy.max_age {
            let filter = policy.filter;
            store.retain(|r| !subject_matches(filter, &r.msg.subject) || r.at.elapsed() <= max_age);
        }
        if let Some(cap) = policy.max_msgs_per_subject {
            let subject = msg.subject.clone();
            let count = store.iter().filter(|r| r.msg.subject == subject).count();
            if count > cap {
                let mut excess = count - cap;
                store.retain(|r| {
                    if excess > 0 && r.msg.subject == subject {
                        excess -= 1;
                        false
                    } else {
                        true
                    }
                });
            }
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: &Value) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let msg = Message {
            subject: subject.to_string(),
            payload: payload.clone(),
        };
        self.retain(&msg);
        // No live subscribers is not an error.
        let _ = self.inner.live.send(msg);
        trace!(subject, "published");
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<Subscription> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let mut live_rx = self.inner.live.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let filter = filter.to_string();
        tokio::spawn(async move {
            loop {
                match live_rx.recv().await {
                    Ok(msg) => {
                        if subject_matches(&filter, &msg.subject) && tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx))
    }

    async fn history(&self, filter: &str) -> Result<Vec<Message>> {
        let store = self.inner.store.lock().unwrap();
        Ok(store
            .iter()
            .filter(|r| subject_matches(filter, &r.msg.subject))
            .map(|r| r.msg.clone())
            .collect())
    }

    async fn request(&self, subject: &str, payload: &Value, timeout: Duration) -> Result<Value> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let handler = {
            let responders = self.inner.responders.lock().unwrap();
            responders
                .iter()
                .find(|r| subject_matches(&r.filter, subject))
                .map(|r| Arc::clone(&r.handler))
        };
        let Some(handler) = handler else {
            return Err(BusError::NoResponder(subject.to_string()));
        };
        let msg = Message {
            subject: subject.to_string(),
            payload: payload.clone(),
        };
        tokio::time::timeout(timeout, handler(msg))
            .await
            .map_err(|_| BusError::Timeout(timeout))
    }

    async fn serve(&self, filter: &str, handler: RpcHandler) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.inner.responders.lock().unwrap().push(Responder {
            filter: filter.to_string(),
            handler,
        });
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_subscribe_with_wildcards() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("svc.status.>").await.unwrap();

        bus.publish("svc.status.echo.t1", &json!({"status": "ok"}))
            .await
            .unwrap();
        bus.publish("svc.heartbeat.echo.t1", &json!({"sequence": 1}))
            .await
            .unwrap();
        bus.publish("svc.status.echo.t2", &json!({"status": "busy"}))
            .await
            .unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.subject, "svc.status.echo.t1");
        let second = sub.next().await.unwrap();
        assert_eq!(second.subject, "svc.status.echo.t2");
        assert_eq!(second.payload["status"], "busy");
    }

    #[tokio::test]
    async fn test_history_replays_retained_messages() {
        let bus = MemoryBus::new();
        for event in ["declared", "start", "ready"] {
            bus.publish(
                &crate::subjects::registry(event, "echo.t1"),
                &json!({"event": event}),
            )
            .await
            .unwrap();
        }
        // RPC subjects are not retained
        bus.publish("svc.rpc.echo.t1.v1.health", &json!({}))
            .await
            .unwrap();

        let history = bus.history("svc.registry.>").await.unwrap();
        let events: Vec<_> = history
            .iter()
            .map(|m| m.payload["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(events, ["declared", "start", "ready"]);
        assert!(bus.history("svc.rpc.>").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_per_subject_message_cap() {
        let mut policy = StreamPolicy::registry();
        policy.max_msgs_per_subject = Some(2);
        let bus = MemoryBus::with_policies(vec![policy]);

        for i in 0..5 {
            bus.publish("svc.registry.status.echo.t1", &json!({ "seq": i }))
                .await
                .unwrap();
        }
        let history = bus.history("svc.registry.>").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].payload["seq"], 3);
        assert_eq!(history[1].payload["seq"], 4);
    }

    #[tokio::test]
    async fn test_request_response() {
        let bus = MemoryBus::new();
        bus.serve(
            "svc.rpc.echo.t1.v1.>",
            Arc::new(|msg: Message| {
                Box::pin(async move {
                    json!({
                        "command": crate::subjects::rpc_command(&msg.subject),
                        "echo": msg.payload,
                    })
                })
            }),
        )
        .await
        .unwrap();

        let reply = bus
            .request(
                "svc.rpc.echo.t1.v1.health",
                &json!({"probe": true}),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply["command"], "health");
        assert_eq!(reply["echo"]["probe"], true);

        let err = bus
            .request("svc.rpc.missing.v1.health", &json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoResponder(_)));
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_publishes() {
        let bus = MemoryBus::new();
        bus.close().await.unwrap();
        let err = bus.publish("svc.status.x", &json!({})).await.unwrap_err();
        assert!(matches!(err, BusError::Closed));
    }
}
