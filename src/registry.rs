//! Cluster registry
//!
//! Name registry with per-name metadata and cluster-wide uniqueness. Two
//! scopes are used: `Connect` (one supervisor per tenant) and `RegionNodes`
//! (node membership by region tag). Racing registrations go through a pure
//! conflict-resolution function; the loser is stopped gracefully.
//!
//! When a Connect registration's metadata gains a live DB handle, a `ready`
//! event fires on `connect:<tenant_id>`. Waiters must subscribe BEFORE
//! re-reading the registry, otherwise a ready fired between their read and
//! their subscribe is lost.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Event};
use crate::database::PoolHandle;

/// Grace period for stopping the loser of a name conflict
const CONFLICT_STOP_GRACE: Duration = Duration::from_secs(30);

/// Registry scopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Connect,
    RegionNodes,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::Connect => "connect",
            Scope::RegionNodes => "region_nodes",
        }
    }
}

/// A process that can be registered under a name and stopped on conflict.
#[async_trait]
pub trait RegisteredProcess: Send + Sync {
    /// Node the process runs on
    fn node(&self) -> &str;
    /// False once the process has exited
    fn is_alive(&self) -> bool;
    /// Graceful stop, bounded by `grace`; past that the process is killed
    async fn stop(&self, grace: Duration);
}

/// Metadata carried by a Connect registration
#[derive(Clone, Debug)]
pub struct ConnectMeta {
    /// The tenant DB pool, populated once the startup pipeline publishes ready
    pub conn: Option<PoolHandle>,
    /// The tenant's configured region
    pub region: String,
}

/// Metadata carried by a node registration
#[derive(Clone, Debug)]
pub struct NodeMeta {
    pub region: String,
    pub rpc_addr: String,
}

struct Registration {
    process: Arc<dyn RegisteredProcess>,
    meta: ConnectMeta,
    registered_at: u64,
}

/// Which claimant survives a name conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    Existing,
    Challenger,
}

/// Pure conflict resolution: prefer the claimant whose node sits in the
/// tenant's platform region; when neither or both do, the earlier
/// registration wins.
pub fn resolve_conflict(
    existing_in_region: bool,
    existing_at: u64,
    challenger_in_region: bool,
    challenger_at: u64,
) -> Keep {
    match (existing_in_region, challenger_in_region) {
        (true, false) => Keep::Existing,
        (false, true) => Keep::Challenger,
        _ => {
            if challenger_at < existing_at {
                Keep::Challenger
            } else {
                Keep::Existing
            }
        }
    }
}

/// Ready/down topic for a tenant's Connect registration
pub fn ready_topic(tenant_id: &str) -> String {
    format!("connect:{tenant_id}")
}

/// The cluster registry.
pub struct Registry {
    bus: Arc<Bus>,
    connects: DashMap<String, Registration>,
    nodes: DashMap<String, NodeMeta>,
}

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("name already registered: {0}")]
    Conflict(String),
}

impl Registry {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self {
            bus,
            connects: DashMap::new(),
            nodes: DashMap::new(),
        }
    }

    /// Register a Connect supervisor under a tenant id. On a race the
    /// conflict is resolved; when the challenger loses this returns
    /// `Err(Conflict)` and the caller must stop itself.
    pub fn register_connect(
        &self,
        tenant_id: &str,
        process: Arc<dyn RegisteredProcess>,
        meta: ConnectMeta,
    ) -> Result<(), RegistryError> {
        let registered_at = now_ms();

        match self.connects.entry(tenant_id.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Registration {
                    process,
                    meta,
                    registered_at,
                });
                debug!(tenant = tenant_id, "connect registered");
                Ok(())
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let existing = entry.get();

                if !existing.process.is_alive() {
                    debug!(tenant = tenant_id, "replacing dead connect registration");
                    entry.insert(Registration {
                        process,
                        meta,
                        registered_at,
                    });
                    return Ok(());
                }

                let keep = resolve_conflict(
                    self.node_in_region(existing.process.node(), &existing.meta.region),
                    existing.registered_at,
                    self.node_in_region(process.node(), &meta.region),
                    registered_at,
                );

                match keep {
                    Keep::Existing => {
                        info!(tenant = tenant_id, "connect registration lost conflict");
                        Err(RegistryError::Conflict(tenant_id.to_string()))
                    }
                    Keep::Challenger => {
                        let loser = existing.process.clone();
                        entry.insert(Registration {
                            process,
                            meta,
                            registered_at,
                        });
                        self.stop_loser(tenant_id, loser, Scope::Connect);
                        Ok(())
                    }
                }
            }
        }
    }

    fn stop_loser(&self, name: &str, loser: Arc<dyn RegisteredProcess>, scope: Scope) {
        let topic = ready_topic(name);
        let bus = self.bus.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            warn!(name = %name, node = loser.node(), "stopping conflict loser");
            loser.stop(CONFLICT_STOP_GRACE).await;
            bus.publish_event(
                &topic,
                Event::Down {
                    scope: scope.as_str(),
                },
            );
        });
    }

    /// Look up a tenant's Connect registration.
    pub fn lookup_connect(
        &self,
        tenant_id: &str,
    ) -> Option<(Arc<dyn RegisteredProcess>, ConnectMeta)> {
        self.connects
            .get(tenant_id)
            .map(|r| (r.process.clone(), r.meta.clone()))
    }

    /// Update a Connect registration's metadata. Gaining a DB handle fires
    /// the `ready` broadcast on `connect:<tenant_id>`.
    pub fn update_connect(&self, tenant_id: &str, meta: ConnectMeta) {
        let conn = meta.conn.clone();
        if let Some(mut entry) = self.connects.get_mut(tenant_id) {
            entry.meta = meta;
        } else {
            warn!(tenant = tenant_id, "update for unregistered connect");
            return;
        }

        if let Some(conn) = conn {
            self.bus
                .publish_event(&ready_topic(tenant_id), Event::Ready { conn });
        }
    }

    /// Remove a Connect registration, but only when it still belongs to the
    /// given process (a replacement must not be unregistered by the loser).
    pub fn unregister_connect(&self, tenant_id: &str, process: &Arc<dyn RegisteredProcess>) {
        self.connects.remove_if(tenant_id, |_, r| {
            Arc::ptr_eq(&r.process, process)
        });
    }

    /// Subscribe to ready/down events for a tenant. Call this BEFORE
    /// re-reading the registry so a concurrent ready cannot be missed.
    pub fn subscribe_ready(&self, tenant_id: &str) -> tokio::sync::broadcast::Receiver<Event> {
        self.bus.subscribe_events(&ready_topic(tenant_id))
    }

    /// Register a node in the RegionNodes scope.
    pub fn register_node(&self, node: &str, meta: NodeMeta) {
        self.nodes.insert(node.to_string(), meta);
    }

    /// Remove a node from the RegionNodes scope.
    pub fn unregister_node(&self, node: &str) {
        self.nodes.remove(node);
    }

    /// Nodes registered under a region tag, sorted for deterministic
    /// placement.
    pub fn members(&self, region: &str) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .nodes
            .iter()
            .filter(|e| e.value().region == region)
            .map(|e| e.key().clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Every reachable node, sorted.
    pub fn all_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    /// RPC address for a node.
    pub fn node_addr(&self, node: &str) -> Option<String> {
        self.nodes.get(node).map(|m| m.rpc_addr.clone())
    }

    /// Tenant ids with a Connect registration, for node-wide shutdown.
    pub fn connect_names(&self) -> Vec<String> {
        self.connects.iter().map(|e| e.key().clone()).collect()
    }

    fn node_in_region(&self, node: &str, region: &str) -> bool {
        self.nodes
            .get(node)
            .map(|m| m.region == region)
            .unwrap_or(false)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeProcess {
        node: String,
        alive: AtomicBool,
        stopped: AtomicBool,
    }

    impl FakeProcess {
        fn new(node: &str) -> Arc<Self> {
            Arc::new(Self {
                node: node.to_string(),
                alive: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl RegisteredProcess for FakeProcess {
        fn node(&self) -> &str {
            &self.node
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn stop(&self, _grace: Duration) {
            self.stopped.store(true, Ordering::SeqCst);
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    fn meta(region: &str) -> ConnectMeta {
        ConnectMeta {
            conn: None,
            region: region.to_string(),
        }
    }

    #[test]
    fn test_resolve_conflict_region_wins() {
        assert_eq!(resolve_conflict(true, 10, false, 1), Keep::Existing);
        assert_eq!(resolve_conflict(false, 1, true, 10), Keep::Challenger);
    }

    #[test]
    fn test_resolve_conflict_timestamp_breaks_ties() {
        assert_eq!(resolve_conflict(true, 5, true, 1), Keep::Challenger);
        assert_eq!(resolve_conflict(false, 1, false, 5), Keep::Existing);
        // Equal timestamps keep the incumbent
        assert_eq!(resolve_conflict(false, 3, false, 3), Keep::Existing);
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = Registry::new(Arc::new(Bus::new()));
        let process = FakeProcess::new("node-a");

        registry
            .register_connect("t1", process.clone(), meta("us-east-1"))
            .unwrap();

        let (found, found_meta) = registry.lookup_connect("t1").unwrap();
        assert_eq!(found.node(), "node-a");
        assert_eq!(found_meta.region, "us-east-1");
        assert!(found_meta.conn.is_none());
    }

    #[tokio::test]
    async fn test_challenger_loses_against_in_region_incumbent() {
        let registry = Registry::new(Arc::new(Bus::new()));
        registry.register_node(
            "node-a",
            NodeMeta {
                region: "us-east-1".to_string(),
                rpc_addr: "127.0.0.1:1".to_string(),
            },
        );

        let incumbent = FakeProcess::new("node-a");
        let challenger = FakeProcess::new("node-b");

        registry
            .register_connect("t1", incumbent, meta("us-east-1"))
            .unwrap();
        let result = registry.register_connect("t1", challenger, meta("us-east-1"));

        assert!(matches!(result, Err(RegistryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_in_region_challenger_evicts_incumbent() {
        let registry = Registry::new(Arc::new(Bus::new()));
        registry.register_node(
            "node-b",
            NodeMeta {
                region: "us-east-1".to_string(),
                rpc_addr: "127.0.0.1:2".to_string(),
            },
        );

        let incumbent = FakeProcess::new("node-a");
        let challenger = FakeProcess::new("node-b");

        registry
            .register_connect("t1", incumbent.clone(), meta("us-east-1"))
            .unwrap();
        registry
            .register_connect("t1", challenger.clone(), meta("us-east-1"))
            .unwrap();

        let (found, _) = registry.lookup_connect("t1").unwrap();
        assert_eq!(found.node(), "node-b");

        // The loser is stopped in the background
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(incumbent.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dead_registration_is_replaced() {
        let registry = Registry::new(Arc::new(Bus::new()));
        let dead = FakeProcess::new("node-a");
        dead.alive.store(false, Ordering::SeqCst);

        registry.register_connect("t1", dead, meta("r")).unwrap();
        let replacement = FakeProcess::new("node-b");
        registry
            .register_connect("t1", replacement, meta("r"))
            .unwrap();

        let (found, _) = registry.lookup_connect("t1").unwrap();
        assert_eq!(found.node(), "node-b");
    }

    #[tokio::test]
    async fn test_unregister_only_removes_own_registration() {
        let registry = Registry::new(Arc::new(Bus::new()));
        let first = FakeProcess::new("node-a");
        registry.register_connect("t1", first.clone(), meta("r")).unwrap();

        let other: Arc<dyn RegisteredProcess> = FakeProcess::new("node-b");
        registry.unregister_connect("t1", &other);
        assert!(registry.lookup_connect("t1").is_some());

        let own: Arc<dyn RegisteredProcess> = first;
        registry.unregister_connect("t1", &own);
        assert!(registry.lookup_connect("t1").is_none());
    }

    #[tokio::test]
    async fn test_members_sorted_by_region() {
        let registry = Registry::new(Arc::new(Bus::new()));
        for (node, region) in [("b", "eu"), ("a", "eu"), ("c", "us")] {
            registry.register_node(
                node,
                NodeMeta {
                    region: region.to_string(),
                    rpc_addr: format!("{node}:4369"),
                },
            );
        }

        assert_eq!(registry.members("eu"), vec!["a", "b"]);
        assert_eq!(registry.members("us"), vec!["c"]);
        assert_eq!(registry.all_nodes(), vec!["a", "b", "c"]);
    }
}
