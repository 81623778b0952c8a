//! TenantCast - Multi-tenant realtime message fan-out
//!
//! For each tenant, TenantCast keeps a supervised link to that tenant's
//! PostgreSQL database, ingests committed inserts to the message table over
//! logical replication, and fans them out to topic subscribers. Per-client
//! broadcast and presence operations are authorized against the tenant's own
//! row-level security policies.
//!
//! ## Architecture
//!
//! ```text
//! Client session ─► Channel handlers ─► Bus ─► subscriber sinks
//!                        │                ▲
//!                        ▼                │
//!                  Authorization    Replication ingester
//!                        │                │
//!                        ▼                │
//!                  Tenant DB ◄── Connect supervisor (per tenant)
//! ```
//!
//! A Connect supervisor owns its tenant's DB pool and replication ingester;
//! the cluster registry keeps supervisors unique per tenant across nodes.

pub mod authorization;
pub mod bus;
pub mod channel;
pub mod config;
pub mod connect;
pub mod counters;
pub mod database;
pub mod jwt;
pub mod metrics;
pub mod registry;
pub mod replication;
pub mod rpc;
pub mod session;
pub mod tenant;

pub use authorization::{AuthorizationContext, Decision, Policies};
pub use bus::{Bus, Envelope, SocketPush};
pub use config::Config;
pub use connect::{ConnectError, Node, PartitionMigrator};
pub use counters::{CounterKind, RateCounters};
pub use registry::Registry;
pub use session::Session;
pub use tenant::{tenant_topic, Tenant, TenantCache};
