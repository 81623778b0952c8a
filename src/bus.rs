//! Pub/Sub bus
//!
//! Topic-addressed delivery to subscriber sinks, with a fastlane
//! short-circuit: a broadcast is encoded once and the pre-built text frame is
//! pushed directly onto every subscriber's output queue. A separate event
//! layer carries control signals (`ready`, operator events, down
//! notifications) that never touch the data plane.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::database::PoolHandle;

/// Event channel capacity per topic
const EVENT_CAPACITY: usize = 16;

/// The wire envelope delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub topic: String,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    pub payload: Value,
}

impl Envelope {
    /// Envelope for a live handler broadcast: the payload passes through
    /// untouched.
    pub fn broadcast(topic: &str, payload: Value) -> Self {
        Self {
            event: "broadcast".to_string(),
            topic: topic.to_string(),
            reference: None,
            payload,
        }
    }

    /// Envelope for a presence diff.
    pub fn presence_diff(topic: &str, joins: Value, leaves: Value) -> Self {
        Self {
            event: "presence_diff".to_string(),
            topic: topic.to_string(),
            reference: None,
            payload: serde_json::json!({ "joins": joins, "leaves": leaves }),
        }
    }

    /// Encode once for fastlane delivery.
    pub fn encode(&self) -> Arc<str> {
        // Envelope is plain data; serialization cannot fail
        Arc::from(serde_json::to_string(self).unwrap_or_default().as_str())
    }
}

/// A pre-encoded frame pushed onto a subscriber's output queue.
#[derive(Debug, Clone)]
pub enum SocketPush {
    Text(Arc<str>),
}

/// Control events delivered on the event layer.
#[derive(Debug, Clone)]
pub enum Event {
    /// A tenant's DB pool became available
    Ready { conn: PoolHandle },
    /// Operator suspended the tenant
    SuspendTenant,
    /// Operator unsuspended the tenant
    UnsuspendTenant,
    /// Operator asked the tenant's supervisor to stop
    Disconnect,
    /// A registered process went down
    Down { scope: &'static str },
}

/// Topic for operator events targeting one tenant.
pub fn operations_topic(tenant_id: &str) -> String {
    format!("realtime:operations:{tenant_id}")
}

struct Sink {
    tenant_id: String,
    tx: mpsc::Sender<SocketPush>,
}

/// The node-local bus.
pub struct Bus {
    /// Data plane: topic -> (sink id -> sink)
    topics: DashMap<String, HashMap<u64, Sink>>,
    /// Control plane: topic -> broadcast sender
    events: DashMap<String, broadcast::Sender<Event>>,
    /// Connected sinks per tenant
    connected: DashMap<String, HashSet<u64>>,
    next_sink_id: AtomicU64,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            events: DashMap::new(),
            connected: DashMap::new(),
            next_sink_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber sink on a topic. The returned id identifies the
    /// sink for `unsubscribe` and for self-broadcast exclusion.
    pub fn subscribe(&self, topic: &str, tenant_id: &str, tx: mpsc::Sender<SocketPush>) -> u64 {
        let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        self.topics.entry(topic.to_string()).or_default().insert(
            id,
            Sink {
                tenant_id: tenant_id.to_string(),
                tx,
            },
        );
        self.connected
            .entry(tenant_id.to_string())
            .or_default()
            .insert(id);

        debug!(topic, tenant = tenant_id, sink = id, "subscribed");
        id
    }

    /// Remove a sink from a topic.
    pub fn unsubscribe(&self, topic: &str, sink_id: u64) {
        let mut tenant_id = None;
        if let Some(mut sinks) = self.topics.get_mut(topic) {
            if let Some(sink) = sinks.remove(&sink_id) {
                tenant_id = Some(sink.tenant_id);
            }
        }
        if let Some(tenant_id) = tenant_id {
            self.connected.alter(&tenant_id, |_, mut ids| {
                ids.remove(&sink_id);
                ids
            });
        }

        // Clean up empty topics
        if let Some(sinks) = self.topics.get(topic) {
            if sinks.is_empty() {
                drop(sinks);
                self.topics.remove(topic);
                debug!(topic, "removed empty topic");
            }
        }
    }

    /// Publish an envelope on a topic. Encodes once, then pushes the frame to
    /// every sink's output queue. `exclude` suppresses delivery to the sender's
    /// own sink. Returns the number of sinks the frame was pushed to.
    pub fn publish(&self, topic: &str, envelope: &Envelope, exclude: Option<u64>) -> usize {
        let Some(sinks) = self.topics.get(topic) else {
            debug!(topic, "no subscribers for publish");
            return 0;
        };

        let frame = envelope.encode();
        let mut delivered = 0;
        for (id, sink) in sinks.iter() {
            if Some(*id) == exclude {
                continue;
            }
            match sink.tx.try_send(SocketPush::Text(frame.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic, sink = id, "subscriber output queue full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(topic, sink = id, "subscriber gone");
                }
            }
        }

        delivered
    }

    /// Number of sinks subscribed to a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    /// Number of connected sinks for a tenant, across all its topics.
    pub fn connected_users(&self, tenant_id: &str) -> usize {
        self.connected.get(tenant_id).map(|s| s.len()).unwrap_or(0)
    }

    /// Subscribe to the event layer for a topic. Always subscribe BEFORE
    /// re-reading any state the event confirms; see
    /// `registry::Registry::subscribe_ready`.
    pub fn subscribe_events(&self, topic: &str) -> broadcast::Receiver<Event> {
        self.events
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .subscribe()
    }

    /// Publish a control event. Returns the number of receivers.
    pub fn publish_event(&self, topic: &str, event: Event) -> usize {
        let Some(tx) = self.events.get(topic).map(|e| e.value().clone()) else {
            debug!(topic, ?event, "no event subscribers");
            return 0;
        };

        match tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                // All receivers dropped; forget the channel
                if tx.receiver_count() == 0 {
                    self.events.remove(topic);
                }
                0
            }
        }
    }

    /// Publish an operator event for a tenant. Idempotent: re-broadcasting the
    /// same event is harmless, and the target tenant is derived from the topic.
    pub fn broadcast_operation(&self, tenant_id: &str, event: Event) -> usize {
        self.publish_event(&operations_topic(tenant_id), event)
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("topics", &self.topics.len())
            .field("event_topics", &self.events.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = Bus::new();
        let (tx, mut rx) = mpsc::channel(8);
        bus.subscribe("realtime:t1:room", "t1", tx);

        let envelope = Envelope::broadcast("room", serde_json::json!({"x": 1}));
        let delivered = bus.publish("realtime:t1:room", &envelope, None);
        assert_eq!(delivered, 1);

        let SocketPush::Text(frame) = rx.recv().await.unwrap();
        let decoded: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(decoded["event"], "broadcast");
        assert_eq!(decoded["topic"], "room");
        assert!(decoded["ref"].is_null());
        assert_eq!(decoded["payload"]["x"], 1);
    }

    #[tokio::test]
    async fn test_exclude_suppresses_sender() {
        let bus = Bus::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let id1 = bus.subscribe("topic", "t1", tx1);
        bus.subscribe("topic", "t1", tx2);

        let envelope = Envelope::broadcast("topic", Value::Null);
        let delivered = bus.publish("topic", &envelope, Some(id1));
        assert_eq!(delivered, 1);

        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_sink_and_topic() {
        let bus = Bus::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = bus.subscribe("topic", "t1", tx);
        assert_eq!(bus.subscriber_count("topic"), 1);
        assert_eq!(bus.connected_users("t1"), 1);

        bus.unsubscribe("topic", id);
        assert_eq!(bus.subscriber_count("topic"), 0);
        assert_eq!(bus.connected_users("t1"), 0);
    }

    #[tokio::test]
    async fn test_event_layer_roundtrip() {
        let bus = Bus::new();
        let mut rx = bus.subscribe_events(&operations_topic("t1"));

        let receivers = bus.broadcast_operation("t1", Event::SuspendTenant);
        assert_eq!(receivers, 1);
        assert!(matches!(rx.recv().await.unwrap(), Event::SuspendTenant));
    }

    #[tokio::test]
    async fn test_publish_event_without_subscribers() {
        let bus = Bus::new();
        assert_eq!(bus.publish_event("connect:t1", Event::Disconnect), 0);
    }

    #[tokio::test]
    async fn test_presence_diff_shape() {
        let envelope = Envelope::presence_diff(
            "room",
            serde_json::json!({"key1": {"name": "a"}}),
            serde_json::json!({}),
        );
        let decoded: Value = serde_json::from_str(&envelope.encode()).unwrap();
        assert_eq!(decoded["event"], "presence_diff");
        assert_eq!(decoded["payload"]["joins"]["key1"]["name"], "a");
        assert!(decoded["payload"]["leaves"].as_object().unwrap().is_empty());
    }
}
