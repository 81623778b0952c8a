//! Replication ingester
//!
//! Consumes committed inserts to the tenant's message table through a logical
//! replication slot and publishes one fan-out broadcast per row, in commit
//! order. The slot is temporary and uses the `pgoutput` plugin with a
//! publication restricted to the message table; the stream is consumed by
//! polling logical decoding at the tenant extension's poll interval, which
//! also confirms the consumed position back to the slot.

pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_postgres::Client;
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, Envelope};
use crate::database::{self, PoolError};
use crate::metrics::Metrics;
use crate::replication::protocol::{
    pg_timestamp_to_system_time, PgOutputMessage, Relation, TupleValue,
};
use crate::tenant::{tenant_topic, Tenant};

/// Publication covering only the message table
pub const PUBLICATION_NAME: &str = "supabase_realtime_messages_publication";

/// Schema-qualified message table
const MESSAGES_TABLE: &str = "realtime.messages";

/// Replication errors surfaced to the Connect supervisor
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("Temporary Replication slot already exists and in use")]
    SlotInUse,
    #[error("max_wal_senders reached")]
    MaxWalSendersReached,
    #[error("timed out starting replication")]
    Timeout,
    #[error("tenant has no database extension")]
    NoDatabase,
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    #[error("connection error: {0}")]
    Pool(#[from] PoolError),
}

/// Where decoded rows are fanned out to. Tenant config selects the local bus
/// adapter or the cluster adapter; the envelope is identical either way.
#[async_trait]
pub trait FanoutAdapter: Send + Sync {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> usize;
}

/// Fan out on this node only.
pub struct LocalFanout {
    bus: Arc<Bus>,
}

impl LocalFanout {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl FanoutAdapter for LocalFanout {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> usize {
        self.bus.publish(topic, envelope, None)
    }
}

/// One decoded row from the message table
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub id: String,
    pub topic: String,
    pub private: bool,
    pub event: Option<String>,
    pub extension: String,
    pub payload: Value,
    pub inserted_at: Option<String>,
    /// From replication metadata, microseconds since the PostgreSQL epoch
    pub committed_at_us: i64,
}

/// Handle to a running ingester. The Connect supervisor owns it and watches
/// `join` for DOWN.
pub struct IngesterHandle {
    stop_tx: watch::Sender<bool>,
    pub join: JoinHandle<()>,
}

impl IngesterHandle {
    /// Ask the ingester to disconnect cleanly.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Ingester settings derived from node config
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    pub slot_name: String,
    pub start_timeout: Duration,
}

/// Start the ingester for a tenant.
///
/// `monitored` is the process that requested replication; when it goes away
/// the ingester disconnects the stream cleanly. Startup (connect, publication,
/// slot creation) is bounded by `start_timeout`.
pub async fn start(
    tenant: Tenant,
    adapter: Arc<dyn FanoutAdapter>,
    metrics: Arc<Metrics>,
    config: IngesterConfig,
    monitored: watch::Receiver<bool>,
) -> Result<IngesterHandle, ReplicationError> {
    let settings = tenant
        .db_settings()
        .cloned()
        .ok_or(ReplicationError::NoDatabase)?;

    let client = timeout(config.start_timeout, setup_stream(&settings, &config.slot_name))
        .await
        .map_err(|_| ReplicationError::Timeout)??;

    info!(
        tenant = %tenant.external_id,
        slot = %config.slot_name,
        "replication ingester started"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let poll_interval = Duration::from_millis(settings.poll_interval_ms);
    let join = tokio::spawn(run_loop(
        client,
        tenant,
        adapter,
        metrics,
        config.slot_name,
        poll_interval,
        stop_rx,
        monitored,
    ));

    Ok(IngesterHandle { stop_tx, join })
}

async fn setup_stream(
    settings: &crate::tenant::DbExtension,
    slot_name: &str,
) -> Result<Client, ReplicationError> {
    let client = database::connect_client(settings).await?;

    let existing = client
        .query(
            "SELECT 1 FROM pg_publication WHERE pubname = $1",
            &[&PUBLICATION_NAME],
        )
        .await?;
    if existing.is_empty() {
        let create = format!("CREATE PUBLICATION {PUBLICATION_NAME} FOR TABLE {MESSAGES_TABLE}");
        if let Err(e) = client.batch_execute(&create).await {
            // A concurrent ingester may have won the race
            let duplicate = e
                .as_db_error()
                .map(|db| db.code() == &tokio_postgres::error::SqlState::DUPLICATE_OBJECT)
                .unwrap_or(false);
            if !duplicate {
                return Err(ReplicationError::Db(e));
            }
        }
    }

    // Temporary: the slot dies with this connection
    if let Err(e) = client
        .query(
            "SELECT pg_create_logical_replication_slot($1, 'pgoutput', true)",
            &[&slot_name],
        )
        .await
    {
        return Err(classify_slot_error(e));
    }

    Ok(client)
}

fn classify_slot_error(e: tokio_postgres::Error) -> ReplicationError {
    use tokio_postgres::error::SqlState;

    if let Some(db) = e.as_db_error() {
        if db.code() == &SqlState::DUPLICATE_OBJECT {
            return ReplicationError::SlotInUse;
        }
        if db.code() == &SqlState::CONFIGURATION_LIMIT_EXCEEDED
            || db.message().contains("max_wal_senders")
        {
            return ReplicationError::MaxWalSendersReached;
        }
    }
    ReplicationError::Db(e)
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    client: Client,
    tenant: Tenant,
    adapter: Arc<dyn FanoutAdapter>,
    metrics: Arc<Metrics>,
    slot_name: String,
    poll_interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
    mut monitored: watch::Receiver<bool>,
) {
    let mut state = DecoderState::new();
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let changes = match poll_changes(&client, &slot_name).await {
                    Ok(changes) => changes,
                    Err(e) => {
                        error!(
                            tenant = %tenant.external_id,
                            error = %e,
                            "replication stream failed"
                        );
                        break;
                    }
                };

                for data in changes {
                    let rows = match protocol::decode(&data) {
                        Ok(message) => state.apply(message),
                        Err(e) => {
                            // A malformed message is skipped, not fatal
                            warn!(tenant = %tenant.external_id, error = %e, "undecodable pgoutput message");
                            continue;
                        }
                    };
                    for row in rows {
                        emit_row(&tenant, row, adapter.as_ref(), &metrics).await;
                    }
                }
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    info!(tenant = %tenant.external_id, "replication ingester stopping");
                    break;
                }
            }
            changed = monitored.changed() => {
                if changed.is_err() || *monitored.borrow() {
                    info!(
                        tenant = %tenant.external_id,
                        "Disconnecting broadcast changes handler in the step"
                    );
                    break;
                }
            }
        }
    }
}

/// Fetch pending changes. The `get` variant confirms the consumed position,
/// advancing the slot so the WAL can be reclaimed.
async fn poll_changes(client: &Client, slot_name: &str) -> Result<Vec<Vec<u8>>, ReplicationError> {
    let rows = client
        .query(
            "SELECT data FROM pg_logical_slot_get_binary_changes($1, NULL, NULL, \
             'proto_version', '1', 'publication_names', $2)",
            &[&slot_name, &PUBLICATION_NAME],
        )
        .await?;

    Ok(rows.into_iter().map(|row| row.get::<_, Vec<u8>>(0)).collect())
}

/// Streaming decoder state: relation metadata and the current transaction's
/// commit timestamp. Rows come out in commit order because pgoutput only
/// streams committed transactions, in order.
struct DecoderState {
    relations: HashMap<u32, Relation>,
    commit_ts_us: i64,
}

impl DecoderState {
    fn new() -> Self {
        Self {
            relations: HashMap::new(),
            commit_ts_us: 0,
        }
    }

    fn apply(&mut self, message: PgOutputMessage) -> Vec<MessageRow> {
        match message {
            PgOutputMessage::Begin { commit_ts_us, .. } => {
                self.commit_ts_us = commit_ts_us;
                Vec::new()
            }
            PgOutputMessage::Relation(relation) => {
                self.relations.insert(relation.id, relation);
                Vec::new()
            }
            PgOutputMessage::Insert {
                relation_id,
                tuple,
            } => {
                let Some(relation) = self.relations.get(&relation_id) else {
                    warn!(relation_id, "insert for unknown relation");
                    return Vec::new();
                };
                if relation.name != "messages" {
                    return Vec::new();
                }
                decode_row(relation, &tuple, self.commit_ts_us)
                    .into_iter()
                    .collect()
            }
            PgOutputMessage::Commit { .. } | PgOutputMessage::Other(_) => Vec::new(),
        }
    }
}

fn decode_row(relation: &Relation, tuple: &[TupleValue], commit_ts_us: i64) -> Option<MessageRow> {
    let mut columns: HashMap<&str, Option<&str>> = HashMap::new();
    for (name, value) in relation.columns.iter().zip(tuple.iter()) {
        let text = match value {
            TupleValue::Text(text) => Some(text.as_str()),
            TupleValue::Null | TupleValue::Unchanged => None,
        };
        columns.insert(name.as_str(), text);
    }

    let field = |name: &str| columns.get(name).copied().flatten();

    Some(MessageRow {
        id: field("id")?.to_string(),
        topic: field("topic")?.to_string(),
        private: field("private") == Some("t"),
        event: field("event").map(String::from),
        extension: field("extension").unwrap_or_default().to_string(),
        payload: field("payload")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| json!({})),
        inserted_at: field("inserted_at").map(String::from),
        committed_at_us: commit_ts_us,
    })
}

/// Merge the row id into the payload without overriding one the payload
/// already carries.
fn payload_with_id(payload: &Value, id: &str) -> Value {
    let mut object: Map<String, Value> = match payload {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    object
        .entry("id".to_string())
        .or_insert_with(|| Value::String(id.to_string()));
    Value::Object(object)
}

/// Validate and publish one row. Rows that are not broadcastable are logged
/// and dropped without failing the stream.
async fn emit_row(tenant: &Tenant, row: MessageRow, adapter: &dyn FanoutAdapter, metrics: &Metrics) {
    let Some(event) = row.event.clone() else {
        warn!(
            tenant = %tenant.external_id,
            topic = %row.topic,
            "UnableToBroadcastChanges"
        );
        return;
    };
    if row.extension != "broadcast" {
        warn!(
            tenant = %tenant.external_id,
            topic = %row.topic,
            extension = %row.extension,
            "UnableToBroadcastChanges"
        );
        return;
    }

    let topic = tenant_topic(&tenant.external_id, &row.topic, row.private);
    let envelope = Envelope {
        event: "broadcast".to_string(),
        topic: row.topic.clone(),
        reference: None,
        payload: json!({
            "type": "broadcast",
            "event": event,
            "payload": payload_with_id(&row.payload, &row.id),
        }),
    };

    let delivered = adapter.publish(&topic, &envelope).await;
    debug!(
        tenant = %tenant.external_id,
        topic = %topic,
        delivered,
        "broadcast_from_database"
    );

    let now = SystemTime::now();
    let latency_committed_at = now
        .duration_since(pg_timestamp_to_system_time(row.committed_at_us))
        .unwrap_or_default();
    let latency_inserted_at = row
        .inserted_at
        .as_deref()
        .and_then(parse_pg_timestamp)
        .and_then(|t| now.duration_since(t).ok());
    metrics.observe_broadcast_from_database(latency_committed_at, latency_inserted_at);
}

/// Parse the text form PostgreSQL sends for `timestamptz` columns.
fn parse_pg_timestamp(raw: &str) -> Option<SystemTime> {
    let formats = ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"];
    for format in formats {
        if let Ok(parsed) = chrono::DateTime::parse_from_str(raw, format) {
            let micros = parsed.timestamp_micros();
            if micros >= 0 {
                return Some(std::time::UNIX_EPOCH + Duration::from_micros(micros as u64));
            }
        }
    }
    None
}
