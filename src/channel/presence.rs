//! Presence handler
//!
//! Tracks which keys are present on a topic and fans out a `presence_diff`
//! for every change. Gating mirrors the broadcast handler: public channels
//! are always allowed, private channels follow the probed write capability.

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::authorization::{AuthError, Authorizer, Direction};
use crate::bus::{Bus, Envelope};
use crate::channel::{write_gate, Gate, Reply};
use crate::counters::{CounterKind, RateCounters};
use crate::session::Session;

/// Node-local presence state per fan-out topic.
pub struct PresenceStore {
    /// tenant_topic -> (presence_key -> metadata)
    records: DashMap<String, Map<String, Value>>,
}

/// Joins and leaves produced by one presence change
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceDiff {
    pub joins: Value,
    pub leaves: Value,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Track a key. A second track with the same key replaces its metadata:
    /// the old metadata shows up in `leaves`, the new one in `joins`.
    pub fn track(&self, topic: &str, key: &str, meta: Value) -> PresenceDiff {
        let mut records = self.records.entry(topic.to_string()).or_default();
        let previous = records.insert(key.to_string(), meta.clone());

        let leaves = match previous {
            Some(old) => json!({ key: old }),
            None => json!({}),
        };
        debug!(topic, key, "presence tracked");

        PresenceDiff {
            joins: json!({ key: meta }),
            leaves,
        }
    }

    /// Untrack a key. Returns `None` when the key was not present, in which
    /// case nothing is published.
    pub fn untrack(&self, topic: &str, key: &str) -> Option<PresenceDiff> {
        let mut records = self.records.get_mut(topic)?;
        let old = records.remove(key)?;

        let empty = records.is_empty();
        drop(records);
        if empty {
            self.records.remove(topic);
        }
        debug!(topic, key, "presence untracked");

        Some(PresenceDiff {
            joins: json!({}),
            leaves: json!({ key: old }),
        })
    }

    /// Current presence map for a topic.
    pub fn state(&self, topic: &str) -> Value {
        self.records
            .get(topic)
            .map(|r| Value::Object(r.clone()))
            .unwrap_or_else(|| json!({}))
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle one inbound presence event (`track` or `untrack`).
pub async fn handle(
    payload: &Value,
    auth: &dyn Authorizer,
    bus: &Bus,
    counters: &RateCounters,
    store: &PresenceStore,
    session: &mut Session,
) -> Result<Reply, AuthError> {
    counters.add(&session.tenant_id, CounterKind::RequestsPerSecond, 1);

    if !session.presence_enabled {
        return Ok(Reply::Ok);
    }

    let event = payload.get("event").and_then(|e| e.as_str()).unwrap_or("");
    if event != "track" && event != "untrack" {
        warn!(
            tenant = %session.tenant_id,
            topic = %session.topic,
            event,
            "UnknownPresenceEvent"
        );
        return Ok(Reply::Error);
    }

    loop {
        match write_gate(session.private, session.policies.presence.write) {
            Gate::Allow => break,
            Gate::Block => {
                debug!(
                    tenant = %session.tenant_id,
                    topic = %session.topic,
                    "presence change dropped, write capability denied"
                );
                return Ok(Reply::NoReply);
            }
            Gate::Probe => match auth.probe(Direction::Write, &session.context).await {
                Ok(probed) => {
                    session.policies.merge_direction(Direction::Write, &probed);
                }
                Err(AuthError::RlsPolicy(e)) => {
                    session.policies.latch_denied(Direction::Write);
                    return Err(AuthError::RlsPolicy(e));
                }
                Err(e) => return Err(e),
            },
        }
    }

    let key = presence_key(session);
    let diff = match event {
        "track" => {
            let meta = payload.get("payload").cloned().unwrap_or_else(|| json!({}));
            counters.add(&session.tenant_id, CounterKind::JoinsPerSecond, 1);
            Some(store.track(&session.tenant_topic, &key, meta))
        }
        _ => store.untrack(&session.tenant_topic, &key),
    };

    if let Some(diff) = diff {
        let envelope = Envelope::presence_diff(&session.topic, diff.joins, diff.leaves);
        bus.publish(&session.tenant_topic, &envelope, None);
        counters.add(&session.tenant_id, CounterKind::EventsPerSecond, 1);
    }

    Ok(Reply::Ok)
}

fn presence_key(session: &Session) -> String {
    session
        .presence_key
        .clone()
        .or_else(|| {
            session
                .context
                .claims
                .get("sub")
                .and_then(|s| s.as_str())
                .map(String::from)
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::{AuthorizationContext, Decision, Policies};
    use crate::bus::SocketPush;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct FakeAuthorizer {
        result: Mutex<Option<Result<Policies, AuthError>>>,
        probes: AtomicUsize,
    }

    impl FakeAuthorizer {
        fn granting(write: Decision) -> Self {
            let mut policies = Policies::default();
            policies.broadcast.write = write;
            policies.presence.write = write;
            Self {
                result: Mutex::new(Some(Ok(policies))),
                probes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Authorizer for FakeAuthorizer {
        async fn probe(
            &self,
            _direction: Direction,
            _ctx: &AuthorizationContext,
        ) -> Result<Policies, AuthError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.result
                .lock()
                .unwrap()
                .take()
                .expect("unexpected extra probe")
        }
    }

    fn session_with_sink(bus: &Bus, private: bool) -> (Session, mpsc::Receiver<SocketPush>) {
        let (tx, rx) = mpsc::channel(64);
        let ctx = AuthorizationContext {
            tenant_id: "t1".to_string(),
            topic: "room:1".to_string(),
            jwt: String::new(),
            claims: serde_json::json!({"sub": "user_42"}),
            headers: HashMap::new(),
            role: "authenticated".to_string(),
        };
        let topic = crate::tenant::tenant_topic(&ctx.tenant_id, &ctx.topic, private);
        let sink_id = bus.subscribe(&topic, &ctx.tenant_id, tx);
        let mut session = Session::new(ctx, private, sink_id);
        session.presence_key = Some("user_42".to_string());
        (session, rx)
    }

    #[tokio::test]
    async fn test_track_publishes_diff_and_counts_join() {
        let bus = Bus::new();
        let counters = RateCounters::new();
        let store = PresenceStore::new();
        let auth = FakeAuthorizer::granting(Decision::Granted);
        let (mut session, mut rx) = session_with_sink(&bus, false);

        let payload = serde_json::json!({"event": "track", "payload": {"name": "a"}});
        let reply = handle(&payload, &auth, &bus, &counters, &store, &mut session)
            .await
            .unwrap();
        assert_eq!(reply, Reply::Ok);

        let SocketPush::Text(frame) = rx.try_recv().unwrap();
        let decoded: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(decoded["event"], "presence_diff");
        assert_eq!(decoded["payload"]["joins"]["user_42"]["name"], "a");

        assert_eq!(counters.get("t1", CounterKind::JoinsPerSecond).sum, 1);
        assert_eq!(counters.get("t1", CounterKind::EventsPerSecond).sum, 1);
    }

    #[tokio::test]
    async fn test_track_then_untrack_restores_state() {
        let bus = Bus::new();
        let counters = RateCounters::new();
        let store = PresenceStore::new();
        let auth = FakeAuthorizer::granting(Decision::Granted);
        let (mut session, _rx) = session_with_sink(&bus, false);

        let before = store.state(&session.tenant_topic);

        let track = serde_json::json!({"event": "track", "payload": {"name": "a"}});
        handle(&track, &auth, &bus, &counters, &store, &mut session)
            .await
            .unwrap();
        let untrack = serde_json::json!({"event": "untrack"});
        handle(&untrack, &auth, &bus, &counters, &store, &mut session)
            .await
            .unwrap();

        assert_eq!(store.state(&session.tenant_topic), before);
    }

    #[tokio::test]
    async fn test_retrack_replaces_metadata() {
        let store = PresenceStore::new();
        store.track("topic", "k", serde_json::json!({"v": 1}));
        let diff = store.track("topic", "k", serde_json::json!({"v": 2}));

        assert_eq!(diff.joins["k"]["v"], 2);
        assert_eq!(diff.leaves["k"]["v"], 1);
        assert_eq!(store.state("topic")["k"]["v"], 2);
    }

    #[tokio::test]
    async fn test_untrack_missing_key_publishes_nothing() {
        let bus = Bus::new();
        let counters = RateCounters::new();
        let store = PresenceStore::new();
        let auth = FakeAuthorizer::granting(Decision::Granted);
        let (mut session, mut rx) = session_with_sink(&bus, false);

        let payload = serde_json::json!({"event": "untrack"});
        let reply = handle(&payload, &auth, &bus, &counters, &store, &mut session)
            .await
            .unwrap();

        assert_eq!(reply, Reply::Ok);
        assert!(rx.try_recv().is_err());
        assert_eq!(counters.get("t1", CounterKind::EventsPerSecond).sum, 0);
    }

    #[tokio::test]
    async fn test_unknown_event_replies_error() {
        let bus = Bus::new();
        let counters = RateCounters::new();
        let store = PresenceStore::new();
        let auth = FakeAuthorizer::granting(Decision::Granted);
        let (mut session, _rx) = session_with_sink(&bus, false);

        let payload = serde_json::json!({"event": "wave"});
        let reply = handle(&payload, &auth, &bus, &counters, &store, &mut session)
            .await
            .unwrap();

        assert_eq!(reply, Reply::Error);
    }

    #[tokio::test]
    async fn test_presence_disabled_is_noop() {
        let bus = Bus::new();
        let counters = RateCounters::new();
        let store = PresenceStore::new();
        let auth = FakeAuthorizer::granting(Decision::Granted);
        let (mut session, mut rx) = session_with_sink(&bus, true);
        session.presence_enabled = false;

        let payload = serde_json::json!({"event": "track"});
        let reply = handle(&payload, &auth, &bus, &counters, &store, &mut session)
            .await
            .unwrap();

        assert_eq!(reply, Reply::Ok);
        assert!(rx.try_recv().is_err());
        // Disabled presence never probes, even on a private channel
        assert_eq!(auth.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_private_denied_blocks_track() {
        let bus = Bus::new();
        let counters = RateCounters::new();
        let store = PresenceStore::new();
        let auth = FakeAuthorizer::granting(Decision::Denied);
        let (mut session, mut rx) = session_with_sink(&bus, true);

        let payload = serde_json::json!({"event": "track"});
        let reply = handle(&payload, &auth, &bus, &counters, &store, &mut session)
            .await
            .unwrap();

        assert_eq!(reply, Reply::NoReply);
        assert!(rx.try_recv().is_err());
        assert!(store.state(&session.tenant_topic).as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_private_probe_runs_once_across_changes() {
        let bus = Bus::new();
        let counters = RateCounters::new();
        let store = PresenceStore::new();
        let auth = FakeAuthorizer::granting(Decision::Granted);
        let (mut session, _rx) = session_with_sink(&bus, true);

        for _ in 0..5 {
            let payload = serde_json::json!({"event": "track", "payload": {}});
            handle(&payload, &auth, &bus, &counters, &store, &mut session)
                .await
                .unwrap();
        }

        assert_eq!(auth.probes.load(Ordering::SeqCst), 1);
    }
}
