//! Tenant records and the short-TTL tenant cache
//!
//! Tenants are created and updated by an external API; the core treats them
//! as read-mostly. The cache fronts that API with a per-record TTL so the
//! Connect startup pipeline and session authorization never block on it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A tenant: one isolated customer environment with its own database
/// and JWT material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// Globally unique external identifier
    pub external_id: String,
    /// Preferred region for this tenant's Connect supervisor
    pub region: String,
    /// Suspended tenants refuse new connections
    #[serde(default)]
    pub suspend: bool,
    /// HS256 secret for session JWT verification
    pub jwt_secret: String,
    /// Optional JWKS document for asymmetric verification
    #[serde(default)]
    pub jwt_jwks: Option<serde_json::Value>,
    /// Number of migrations already applied to the tenant DB
    #[serde(default)]
    pub migrations_ran: u32,
    /// How replication fan-outs leave this node
    #[serde(default)]
    pub broadcast_adapter: BroadcastAdapter,
    /// Database connection extensions, in priority order
    pub extensions: Vec<DbExtension>,
}

/// Fan-out adapter selection for the replication ingester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastAdapter {
    /// Deliver on this node's bus only
    #[default]
    Local,
    /// Deliver locally and relay to the rest of the cluster over RPC
    Cluster,
}

/// Connection settings for one tenant database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbExtension {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db_name: String,
    /// Poll interval for extensions that poll instead of stream
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// When set, TLS is mandatory for every connection to this database
    #[serde(default)]
    pub ssl_enforced: bool,
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Tenant {
    /// The primary DB extension. Tenants without one cannot be served.
    pub fn db_settings(&self) -> Option<&DbExtension> {
        self.extensions.first()
    }
}

/// Compose the fan-out topic for a tenant-scoped channel.
///
/// Public and private channels with the same name never share a fan-out:
/// a private channel's bus topic carries a distinguishing suffix, so a
/// subscriber authorized for one can never observe the other.
pub fn tenant_topic(external_id: &str, topic: &str, private: bool) -> String {
    if private {
        format!("realtime:{external_id}:{topic}:private")
    } else {
        format!("realtime:{external_id}:{topic}")
    }
}

/// Source of truth for tenant records (the external tenant API).
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Fetch a tenant by external id. `Ok(None)` means the tenant does not exist.
    async fn fetch(&self, external_id: &str) -> anyhow::Result<Option<Tenant>>;
}

/// In-memory store for development and tests.
#[derive(Default)]
pub struct MemoryTenantStore {
    tenants: DashMap<String, Tenant>,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, tenant: Tenant) {
        self.tenants.insert(tenant.external_id.clone(), tenant);
    }

    pub fn remove(&self, external_id: &str) {
        self.tenants.remove(external_id);
    }
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
    async fn fetch(&self, external_id: &str) -> anyhow::Result<Option<Tenant>> {
        Ok(self.tenants.get(external_id).map(|t| t.clone()))
    }
}

/// Short-TTL cache of tenant records keyed by external id.
pub struct TenantCache {
    store: Arc<dyn TenantStore>,
    entries: DashMap<String, (Tenant, Instant)>,
    ttl: Duration,
}

impl TenantCache {
    pub fn new(store: Arc<dyn TenantStore>, ttl: Duration) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Get a tenant, consulting the store when the cached record is missing
    /// or expired.
    pub async fn get(&self, external_id: &str) -> anyhow::Result<Option<Tenant>> {
        if let Some(entry) = self.entries.get(external_id) {
            let (tenant, cached_at) = entry.value();
            if cached_at.elapsed() < self.ttl {
                return Ok(Some(tenant.clone()));
            }
        }

        match self.store.fetch(external_id).await? {
            Some(tenant) => {
                self.entries
                    .insert(external_id.to_string(), (tenant.clone(), Instant::now()));
                Ok(Some(tenant))
            }
            None => {
                self.entries.remove(external_id);
                Ok(None)
            }
        }
    }

    /// Drop the cached record so the next `get` re-reads the store.
    /// Operator suspend/unsuspend events call this.
    pub fn invalidate(&self, external_id: &str) {
        if self.entries.remove(external_id).is_some() {
            debug!(tenant = external_id, "tenant cache invalidated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tenant(id: &str) -> Tenant {
        Tenant {
            external_id: id.to_string(),
            region: "us-east-1".to_string(),
            suspend: false,
            jwt_secret: "secret".to_string(),
            jwt_jwks: None,
            migrations_ran: 0,
            broadcast_adapter: BroadcastAdapter::default(),
            extensions: vec![DbExtension {
                host: "localhost".to_string(),
                port: 5432,
                user: "postgres".to_string(),
                password: "postgres".to_string(),
                db_name: "postgres".to_string(),
                poll_interval_ms: 100,
                ssl_enforced: false,
            }],
        }
    }

    #[test]
    fn test_tenant_topic_public() {
        assert_eq!(tenant_topic("t1", "room:42", false), "realtime:t1:room:42");
    }

    #[test]
    fn test_tenant_topic_private() {
        assert_eq!(
            tenant_topic("t1", "room:42", true),
            "realtime:t1:room:42:private"
        );
    }

    #[test]
    fn test_public_and_private_never_collide() {
        assert_ne!(
            tenant_topic("t1", "room", true),
            tenant_topic("t1", "room", false)
        );
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let store = Arc::new(MemoryTenantStore::new());
        store.upsert(test_tenant("t1"));
        let cache = TenantCache::new(store.clone(), Duration::from_secs(60));

        assert!(cache.get("t1").await.unwrap().is_some());

        // The cached record survives store removal until invalidated
        store.remove("t1");
        assert!(cache.get("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_forces_reread() {
        let store = Arc::new(MemoryTenantStore::new());
        store.upsert(test_tenant("t1"));
        let cache = TenantCache::new(store.clone(), Duration::from_secs(60));

        assert!(cache.get("t1").await.unwrap().is_some());
        store.remove("t1");
        cache.invalidate("t1");
        assert!(cache.get("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_tenant() {
        let store = Arc::new(MemoryTenantStore::new());
        let cache = TenantCache::new(store, Duration::from_secs(60));
        assert!(cache.get("nope").await.unwrap().is_none());
    }
}
