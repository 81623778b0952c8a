//! Authorization engine
//!
//! Derives per-session capabilities for broadcast and presence by running the
//! tenant's actual RLS policies inside a short transaction on the tenant DB.
//! Static policy inspection is deliberately not an option: the probes execute
//! the tenant's policy program against the message table.
//!
//! A capability is a tri-state: `Unknown` until probed, then a terminal
//! boolean for the rest of the session's life on that channel.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tokio_postgres::Transaction;
use tracing::debug;

use crate::database::{PoolError, PoolHandle};
use crate::metrics::Metrics;

/// Tri-state capability decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decision {
    /// Not yet probed
    #[default]
    Unknown,
    Granted,
    Denied,
}

impl Decision {
    /// Apply a probe result. `Unknown` may become a boolean and a boolean may
    /// be restated; a boolean is never demoted or flipped.
    pub fn apply(&mut self, next: Decision) {
        match (*self, next) {
            (Decision::Unknown, _) => *self = next,
            (current, next) if current == next => {}
            _ => debug!(?self, ?next, "refusing capability demotion"),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Decision::Unknown)
    }

    pub fn granted(&self) -> bool {
        matches!(self, Decision::Granted)
    }
}

/// Broadcast capabilities for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastPolicies {
    pub read: Decision,
    pub write: Decision,
}

/// Presence capabilities for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresencePolicies {
    pub read: Decision,
    pub write: Decision,
}

/// Capability record for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Policies {
    pub broadcast: BroadcastPolicies,
    pub presence: PresencePolicies,
}

/// Probe direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn check_name(&self) -> &'static str {
        match self {
            Direction::Read => "read_authorization_check",
            Direction::Write => "write_authorization_check",
        }
    }
}

impl Policies {
    /// Overwrite one direction's capabilities from a probe result, leaving
    /// the other direction untouched.
    pub fn merge_direction(&mut self, direction: Direction, probed: &Policies) {
        match direction {
            Direction::Read => {
                self.broadcast.read.apply(probed.broadcast.read);
                self.presence.read.apply(probed.presence.read);
            }
            Direction::Write => {
                self.broadcast.write.apply(probed.broadcast.write);
                self.presence.write.apply(probed.presence.write);
            }
        }
    }

    /// Latch one direction's capabilities to denied. Used when a probe raised
    /// inside the tenant's policy program.
    pub fn latch_denied(&mut self, direction: Direction) {
        match direction {
            Direction::Read => {
                self.broadcast.read.apply(Decision::Denied);
                self.presence.read.apply(Decision::Denied);
            }
            Direction::Write => {
                self.broadcast.write.apply(Decision::Denied);
                self.presence.write.apply(Decision::Denied);
            }
        }
    }
}

/// Immutable per-session bundle passed by value to every probe.
#[derive(Debug, Clone)]
pub struct AuthorizationContext {
    pub tenant_id: String,
    pub topic: String,
    pub jwt: String,
    pub claims: Value,
    pub headers: HashMap<String, String>,
    pub role: String,
}

/// Authorization errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The pool was saturated for the whole checkout timeout. The session is
    /// informed but stays alive.
    #[error("increase connection pool")]
    IncreaseConnectionPool,
    /// A probe raised inside the tenant's policy program
    #[error("rls policy error: {0}")]
    RlsPolicy(#[source] tokio_postgres::Error),
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    #[error("pool error: {0}")]
    Pool(PoolError),
}

/// Seam the channel handlers probe through. The production implementation
/// runs transactional probes against the tenant DB; tests substitute a
/// scripted one.
#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    async fn probe(
        &self,
        direction: Direction,
        ctx: &AuthorizationContext,
    ) -> Result<Policies, AuthError>;
}

/// Probes the tenant database through its pool.
pub struct DbAuthorizer {
    pool: PoolHandle,
    metrics: std::sync::Arc<Metrics>,
}

impl DbAuthorizer {
    pub fn new(pool: PoolHandle, metrics: std::sync::Arc<Metrics>) -> Self {
        Self { pool, metrics }
    }
}

#[async_trait::async_trait]
impl Authorizer for DbAuthorizer {
    async fn probe(
        &self,
        direction: Direction,
        ctx: &AuthorizationContext,
    ) -> Result<Policies, AuthError> {
        match direction {
            Direction::Read => get_read_authorizations(&self.pool, ctx, &self.metrics).await,
            Direction::Write => get_write_authorizations(&self.pool, ctx, &self.metrics).await,
        }
    }
}

/// Probe read capabilities for broadcast and presence.
pub async fn get_read_authorizations(
    pool: &PoolHandle,
    ctx: &AuthorizationContext,
    metrics: &Metrics,
) -> Result<Policies, AuthError> {
    run_probes(pool, ctx, Direction::Read, metrics).await
}

/// Probe write capabilities for broadcast and presence.
pub async fn get_write_authorizations(
    pool: &PoolHandle,
    ctx: &AuthorizationContext,
    metrics: &Metrics,
) -> Result<Policies, AuthError> {
    run_probes(pool, ctx, Direction::Write, metrics).await
}

async fn run_probes(
    pool: &PoolHandle,
    ctx: &AuthorizationContext,
    direction: Direction,
    metrics: &Metrics,
) -> Result<Policies, AuthError> {
    let started = Instant::now();

    let mut conn = pool.checkout().await.map_err(|e| match e {
        PoolError::CheckoutTimeout | PoolError::TooManyConnections => {
            AuthError::IncreaseConnectionPool
        }
        other => AuthError::Pool(other),
    })?;

    let mut txn = match direction {
        Direction::Read => {
            conn.build_transaction()
                .read_only(true)
                .start()
                .await
                .map_err(AuthError::Db)?
        }
        Direction::Write => conn.build_transaction().start().await.map_err(AuthError::Db)?,
    };

    set_probe_context(&txn, ctx).await?;

    let result = match direction {
        Direction::Read => probe_reads(&mut txn, &ctx.topic).await,
        Direction::Write => probe_writes(&mut txn, &ctx.topic).await,
    };

    // The transaction must never commit, success or not
    txn.rollback().await.map_err(AuthError::Db)?;

    let policies = result?;
    let latency = started.elapsed();
    metrics.observe_authorization_check(direction, latency);
    debug!(
        tenant = %ctx.tenant_id,
        latency_ns = latency.as_nanos() as u64,
        "{}",
        direction.check_name()
    );

    Ok(policies)
}

/// Set role and request context as transaction-local session variables so the
/// RLS policies see the session's identity.
async fn set_probe_context(
    txn: &Transaction<'_>,
    ctx: &AuthorizationContext,
) -> Result<(), AuthError> {
    let sub = ctx
        .claims
        .get("sub")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let claims = serde_json::to_string(&ctx.claims).unwrap_or_else(|_| "{}".to_string());
    let headers = serde_json::to_string(&ctx.headers).unwrap_or_else(|_| "{}".to_string());

    txn.execute(
        "SELECT set_config('role', $1, true), \
                set_config('request.jwt.claim.sub', $2, true), \
                set_config('request.jwt.claim.role', $3, true), \
                set_config('request.jwt.claims', $4, true), \
                set_config('request.headers', $5, true)",
        &[&ctx.role, &sub, &ctx.role, &claims, &headers],
    )
    .await
    .map_err(AuthError::Db)?;

    Ok(())
}

async fn probe_reads(txn: &mut Transaction<'_>, topic: &str) -> Result<Policies, AuthError> {
    let broadcast = read_probe(txn, topic, "broadcast").await?;
    let presence = read_probe(txn, topic, "presence").await?;

    Ok(Policies {
        broadcast: BroadcastPolicies {
            read: broadcast,
            write: Decision::Unknown,
        },
        presence: PresencePolicies {
            read: presence,
            write: Decision::Unknown,
        },
    })
}

async fn probe_writes(txn: &mut Transaction<'_>, topic: &str) -> Result<Policies, AuthError> {
    let broadcast = write_probe(txn, topic, "broadcast").await?;
    let presence = write_probe(txn, topic, "presence").await?;

    Ok(Policies {
        broadcast: BroadcastPolicies {
            read: Decision::Unknown,
            write: broadcast,
        },
        presence: PresencePolicies {
            read: Decision::Unknown,
            write: presence,
        },
    })
}

/// One SELECT gated by the tenant's read policies. Rows visible means the
/// capability is granted; an empty result or an insufficient-privilege
/// rejection means denied.
async fn read_probe(
    txn: &mut Transaction<'_>,
    topic: &str,
    extension: &str,
) -> Result<Decision, AuthError> {
    let savepoint = txn.savepoint("authorization_probe").await.map_err(AuthError::Db)?;
    let result = savepoint
        .query(
            "SELECT id::text FROM realtime.messages WHERE topic = $1 AND extension = $2 LIMIT 1",
            &[&topic, &extension],
        )
        .await;

    match result {
        Ok(rows) => {
            savepoint.commit().await.map_err(AuthError::Db)?;
            Ok(if rows.is_empty() {
                Decision::Denied
            } else {
                Decision::Granted
            })
        }
        Err(e) => {
            savepoint.rollback().await.map_err(AuthError::Db)?;
            classify_probe_error(e)
        }
    }
}

/// One INSERT of a throw-away row gated by the tenant's write policies. The
/// surrounding transaction is always rolled back, so the row is never visible
/// to any other session.
async fn write_probe(
    txn: &mut Transaction<'_>,
    topic: &str,
    extension: &str,
) -> Result<Decision, AuthError> {
    let savepoint = txn.savepoint("authorization_probe").await.map_err(AuthError::Db)?;
    let result = savepoint
        .query(
            "INSERT INTO realtime.messages (topic, extension, private, event, payload) \
             VALUES ($1, $2, true, 'authorization_probe', '{}'::jsonb) RETURNING id::text",
            &[&topic, &extension],
        )
        .await;

    match result {
        Ok(rows) => {
            savepoint.commit().await.map_err(AuthError::Db)?;
            Ok(if rows.is_empty() {
                Decision::Denied
            } else {
                Decision::Granted
            })
        }
        Err(e) => {
            savepoint.rollback().await.map_err(AuthError::Db)?;
            classify_probe_error(e)
        }
    }
}

/// An RLS rejection maps to a denied capability; anything else raised inside
/// the policy program surfaces as a policy error.
fn classify_probe_error(e: tokio_postgres::Error) -> Result<Decision, AuthError> {
    use tokio_postgres::error::SqlState;

    if let Some(db) = e.as_db_error() {
        if db.code() == &SqlState::INSUFFICIENT_PRIVILEGE {
            return Ok(Decision::Denied);
        }
    }

    Err(AuthError::RlsPolicy(e))
}
