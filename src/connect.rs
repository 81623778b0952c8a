//! Connect supervisor
//!
//! One supervisor task per tenant owns the tenant DB pool and the replication
//! ingester. Startup is a deterministic pipeline of steps with early exit;
//! while serving, the task watches operator events, the connected-user count,
//! region placement and its two children. Termination of either child is
//! fatal to the supervisor, which stops the other.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::bus::{operations_topic, Bus, Event};
use crate::config::Config;
use crate::counters::{CounterKind, RateCounters};
use crate::database::{PoolError, PoolHandle, TenantPool};
use crate::metrics::Metrics;
use crate::registry::{ConnectMeta, NodeMeta, RegisteredProcess, Registry};
use crate::replication::{self, FanoutAdapter, IngesterConfig, IngesterHandle, LocalFanout, ReplicationError};
use crate::rpc::{ClusterFanout, ClusterRpc, StartConnectRequest, StartConnectResponse};
use crate::tenant::{BroadcastAdapter, Tenant, TenantCache, TenantStore};

/// Waiters give the startup pipeline this long after subscribing to ready
const WAIT_FOR_READY: Duration = Duration::from_secs(5);

/// Hard ceiling for stopping a supervisor and its children
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Connected-user samples kept for the idle-shutdown decision
const USER_COUNT_BUCKET_LEN: usize = 6;

/// Supervisor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Initializing,
    Migrating,
    Replicating,
    Serving,
    ShuttingDown,
}

/// Failure taxonomy surfaced to callers
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("tenant_not_found")]
    TenantNotFound,
    #[error("tenant_suspended")]
    TenantSuspended,
    #[error("tenant_database_unavailable")]
    TenantDatabaseUnavailable,
    #[error("tenant_db_too_many_connections")]
    TenantDbTooManyConnections,
    #[error("tenant_database_connection_initializing")]
    TenantDatabaseConnectionInitializing,
    #[error("initializing")]
    Initializing,
    #[error("max_wal_senders_reached")]
    MaxWalSendersReached,
    #[error("registration conflict")]
    RegistrationConflict,
    #[error("replication error: {0}")]
    Replication(ReplicationError),
    #[error("migrations failed: {0}")]
    Migrations(String),
    #[error("rpc_error: {0}")]
    Rpc(String),
}

impl ConnectError {
    /// Wire form for cluster RPC responses
    pub fn as_code(&self) -> String {
        match self {
            ConnectError::TenantNotFound => "tenant_not_found".to_string(),
            ConnectError::TenantSuspended => "tenant_suspended".to_string(),
            ConnectError::TenantDatabaseUnavailable => "tenant_database_unavailable".to_string(),
            ConnectError::TenantDbTooManyConnections => {
                "tenant_db_too_many_connections".to_string()
            }
            ConnectError::TenantDatabaseConnectionInitializing => {
                "tenant_database_connection_initializing".to_string()
            }
            ConnectError::Initializing => "initializing".to_string(),
            ConnectError::MaxWalSendersReached => "max_wal_senders_reached".to_string(),
            ConnectError::RegistrationConflict => "registration_conflict".to_string(),
            ConnectError::Replication(ReplicationError::Timeout) => "timeout".to_string(),
            ConnectError::Replication(e) => format!("replication: {e}"),
            ConnectError::Migrations(e) => format!("migrations: {e}"),
            ConnectError::Rpc(reason) => format!("rpc_error: {reason}"),
        }
    }

    /// Parse a wire code back into the taxonomy; unknown codes stay RPC
    /// errors so nothing is silently reinterpreted.
    pub fn from_code(code: &str) -> Self {
        match code {
            "tenant_not_found" => ConnectError::TenantNotFound,
            "tenant_suspended" => ConnectError::TenantSuspended,
            "tenant_database_unavailable" => ConnectError::TenantDatabaseUnavailable,
            "tenant_db_too_many_connections" => ConnectError::TenantDbTooManyConnections,
            "tenant_database_connection_initializing" => {
                ConnectError::TenantDatabaseConnectionInitializing
            }
            "initializing" => ConnectError::Initializing,
            "max_wal_senders_reached" => ConnectError::MaxWalSendersReached,
            "timeout" => ConnectError::Replication(ReplicationError::Timeout),
            other => ConnectError::Rpc(other.to_string()),
        }
    }
}

/// Migration collaborator invoked by the startup pipeline. Schema design is
/// not the core's concern; it only calls this at the right point.
#[async_trait]
pub trait Migrator: Send + Sync {
    async fn run(&self, tenant: &Tenant, pool: &PoolHandle) -> anyhow::Result<()>;
}

/// Creates the message table and the current partition on the tenant DB.
pub struct PartitionMigrator;

#[async_trait]
impl Migrator for PartitionMigrator {
    async fn run(&self, tenant: &Tenant, pool: &PoolHandle) -> anyhow::Result<()> {
        let conn = pool.checkout().await?;
        conn.batch_execute(
            "CREATE SCHEMA IF NOT EXISTS realtime;\n\
             CREATE TABLE IF NOT EXISTS realtime.messages (\n\
                 id uuid NOT NULL DEFAULT gen_random_uuid(),\n\
                 topic text NOT NULL,\n\
                 private boolean NOT NULL DEFAULT false,\n\
                 event text,\n\
                 extension text NOT NULL,\n\
                 payload jsonb NOT NULL DEFAULT '{}'::jsonb,\n\
                 inserted_at timestamptz NOT NULL DEFAULT now(),\n\
                 PRIMARY KEY (id, inserted_at)\n\
             ) PARTITION BY RANGE (inserted_at);\n\
             ALTER TABLE realtime.messages ENABLE ROW LEVEL SECURITY;",
        )
        .await?;

        let today = chrono::Utc::now().date_naive();
        let tomorrow = today + chrono::Days::new(1);
        let partition = format!(
            "CREATE TABLE IF NOT EXISTS realtime.messages_{name} \
             PARTITION OF realtime.messages \
             FOR VALUES FROM ('{from}') TO ('{to}')",
            name = today.format("%Y_%m_%d"),
            from = today,
            to = tomorrow,
        );
        conn.batch_execute(&partition).await?;

        info!(tenant = %tenant.external_id, "migrations ran");
        Ok(())
    }
}

/// Commands accepted by a running supervisor
enum Command {
    Shutdown(&'static str),
}

/// Registry-visible handle to a supervisor task.
pub struct SupervisorHandle {
    node_name: String,
    cmd_tx: mpsc::Sender<Command>,
    done_rx: watch::Receiver<bool>,
    abort: Mutex<Option<tokio::task::AbortHandle>>,
}

#[async_trait]
impl RegisteredProcess for SupervisorHandle {
    fn node(&self) -> &str {
        &self.node_name
    }

    fn is_alive(&self) -> bool {
        !*self.done_rx.borrow()
    }

    async fn stop(&self, grace: Duration) {
        let _ = self.cmd_tx.send(Command::Shutdown("shutdown")).await;

        let mut done = self.done_rx.clone();
        let finished = async {
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        };
        if timeout(grace, finished).await.is_err() {
            warn!(node = %self.node_name, "supervisor did not stop in time, killing");
            if let Some(abort) = self.abort.lock().unwrap().as_ref() {
                abort.abort();
            }
        }
    }
}

/// Signals done on every exit path, including panic and abort.
struct DoneGuard(watch::Sender<bool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.send(true);
    }
}

/// Everything a supervisor needs from its node.
pub struct Node {
    pub name: String,
    pub region: String,
    pub config: Config,
    pub bus: Arc<Bus>,
    pub registry: Arc<Registry>,
    pub cache: Arc<TenantCache>,
    pub counters: Arc<RateCounters>,
    pub metrics: Arc<Metrics>,
    pub migrator: Arc<dyn Migrator>,
}

impl Node {
    pub fn new(
        config: Config,
        store: Arc<dyn TenantStore>,
        migrator: Arc<dyn Migrator>,
    ) -> Arc<Self> {
        let bus = Arc::new(Bus::new());
        let registry = Arc::new(Registry::new(bus.clone()));
        let cache = Arc::new(TenantCache::new(store, config.tenant_cache_ttl));
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| config.node_name.clone());
        let metrics = Arc::new(Metrics::new(&host, &config.region, &config.node_name));

        registry.register_node(
            &config.node_name,
            NodeMeta {
                region: config.region.clone(),
                rpc_addr: config.rpc_addr.clone(),
            },
        );

        Arc::new(Self {
            name: config.node_name.clone(),
            region: config.region.clone(),
            config,
            bus,
            registry,
            cache,
            counters: Arc::new(RateCounters::new()),
            metrics,
            migrator,
        })
    }

    /// Resolve a live DB handle for a tenant, starting its Connect supervisor
    /// on the preferred node if nothing is registered yet.
    pub async fn lookup_or_start_connection(
        self: &Arc<Self>,
        tenant_id: &str,
    ) -> Result<PoolHandle, ConnectError> {
        if let Some((_, meta)) = self.registry.lookup_connect(tenant_id) {
            return match meta.conn {
                Some(conn) => Ok(conn),
                None => self.wait_for_connection(tenant_id).await,
            };
        }

        let tenant = self
            .cache
            .get(tenant_id)
            .await
            .map_err(|e| {
                error!(tenant = tenant_id, error = %e, "tenant lookup failed");
                ConnectError::TenantDatabaseUnavailable
            })?
            .ok_or(ConnectError::TenantNotFound)?;
        if tenant.suspend {
            return Err(ConnectError::TenantSuspended);
        }

        let preferred = self.preferred_node(&tenant.region);
        if preferred == self.name {
            self.start_connect(tenant_id).await
        } else {
            self.start_remote(&preferred, tenant_id).await?;
            self.wait_for_connection(tenant_id).await
        }
    }

    /// Wait for a supervisor mid-startup to publish its DB handle.
    ///
    /// Subscribes first, then re-reads the registry: a ready fired between
    /// the caller's lookup and this subscribe would otherwise be lost.
    async fn wait_for_connection(&self, tenant_id: &str) -> Result<PoolHandle, ConnectError> {
        let mut ready = self.registry.subscribe_ready(tenant_id);

        if let Some((_, meta)) = self.registry.lookup_connect(tenant_id) {
            if let Some(conn) = meta.conn {
                return Ok(conn);
            }
        }

        let wait = async {
            loop {
                match ready.recv().await {
                    Ok(Event::Ready { conn }) => return Some(conn),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        match timeout(WAIT_FOR_READY, wait).await {
            Ok(Some(conn)) => Ok(conn),
            Ok(None) | Err(_) => Err(ConnectError::Initializing),
        }
    }

    /// Start a supervisor on this node and wait for its startup pipeline.
    pub async fn start_connect(
        self: &Arc<Self>,
        tenant_id: &str,
    ) -> Result<PoolHandle, ConnectError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (done_tx, done_rx) = watch::channel(false);
        let handle = Arc::new(SupervisorHandle {
            node_name: self.name.clone(),
            cmd_tx,
            done_rx,
            abort: Mutex::new(None),
        });

        let supervisor = Supervisor {
            tenant_id: tenant_id.to_string(),
            node: self.clone(),
            handle: handle.clone(),
            tenant: None,
            pool: None,
            ingester: None,
            ops_rx: None,
            monitored_tx: watch::channel(false).0,
            state: ConnectState::Initializing,
        };

        let (started_tx, started_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _guard = DoneGuard(done_tx);
            supervisor.run(cmd_rx, started_tx).await;
        });
        *handle.abort.lock().unwrap() = Some(task.abort_handle());

        match started_rx.await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Initializing),
        }
    }

    async fn start_remote(&self, node: &str, tenant_id: &str) -> Result<(), ConnectError> {
        let addr = self
            .registry
            .node_addr(node)
            .ok_or_else(|| ConnectError::Rpc(format!("unknown node {node}")))?;

        info!(tenant = tenant_id, node, "starting connect on preferred node");
        let rpc = ClusterRpc::connect(&addr, self.config.erpc_timeout)
            .await
            .map_err(|e| ConnectError::Rpc(e.to_string()))?;
        let response = rpc
            .start_connect(StartConnectRequest {
                tenant_id: tenant_id.to_string(),
                origin_node: self.name.clone(),
            })
            .await
            .map_err(|e| ConnectError::Rpc(e.to_string()))?;

        if response.status == 0 {
            Ok(())
        } else {
            Err(ConnectError::from_code(&response.error_code))
        }
    }

    /// Serve a remote node's request to start a tenant here.
    pub async fn handle_start_connect(
        self: &Arc<Self>,
        request: StartConnectRequest,
    ) -> StartConnectResponse {
        info!(
            tenant = %request.tenant_id,
            origin = %request.origin_node,
            "remote start connect"
        );
        match self.lookup_or_start_connection(&request.tenant_id).await {
            Ok(_) => StartConnectResponse {
                status: 0,
                error_code: String::new(),
            },
            Err(e) => StartConnectResponse {
                status: 1,
                error_code: e.as_code(),
            },
        }
    }

    /// Gracefully stop a tenant's supervisor if it runs here.
    pub async fn shutdown(&self, tenant_id: &str) {
        if let Some((process, _)) = self.registry.lookup_connect(tenant_id) {
            process.stop(SHUTDOWN_GRACE).await;
        }
    }

    /// Stop every supervisor and leave the cluster.
    pub async fn shutdown_all(&self) {
        for tenant_id in self.registry.connect_names() {
            self.shutdown(&tenant_id).await;
        }
        self.registry.unregister_node(&self.name);
    }

    /// Deterministic placement: the first node registered in the region, or
    /// this node when the region is empty.
    fn preferred_node(&self, region: &str) -> String {
        self.registry
            .members(region)
            .into_iter()
            .next()
            .unwrap_or_else(|| self.name.clone())
    }
}

/// The startup pipeline, in order. Any step failure short-circuits into
/// shutdown with that step's error.
#[derive(Debug, Clone, Copy)]
enum Step {
    GetTenant,
    CheckConnection,
    StartCounters,
    RegisterProcess,
    RunMigrations,
    StartReplication,
    PublishReady,
    SetupWatchdogs,
}

const STARTUP_PIPELINE: [Step; 8] = [
    Step::GetTenant,
    Step::CheckConnection,
    Step::StartCounters,
    Step::RegisterProcess,
    Step::RunMigrations,
    Step::StartReplication,
    Step::PublishReady,
    Step::SetupWatchdogs,
];

impl Step {
    fn name(self) -> &'static str {
        match self {
            Step::GetTenant => "get_tenant",
            Step::CheckConnection => "check_connection",
            Step::StartCounters => "start_counters",
            Step::RegisterProcess => "register_process",
            Step::RunMigrations => "run_migrations",
            Step::StartReplication => "start_replication",
            Step::PublishReady => "publish_ready",
            Step::SetupWatchdogs => "setup_watchdogs",
        }
    }
}

struct Supervisor {
    tenant_id: String,
    node: Arc<Node>,
    handle: Arc<SupervisorHandle>,
    tenant: Option<Tenant>,
    pool: Option<PoolHandle>,
    ingester: Option<IngesterHandle>,
    ops_rx: Option<broadcast::Receiver<Event>>,
    monitored_tx: watch::Sender<bool>,
    state: ConnectState,
}

impl Supervisor {
    async fn run(
        mut self,
        cmd_rx: mpsc::Receiver<Command>,
        started_tx: oneshot::Sender<Result<PoolHandle, ConnectError>>,
    ) {
        self.node.metrics.connect_started();

        match self.startup().await {
            Ok(()) => match self.pool.clone() {
                Some(pool) => {
                    let _ = started_tx.send(Ok(pool));
                }
                None => {
                    let _ = started_tx.send(Err(ConnectError::TenantDatabaseUnavailable));
                    self.cleanup("startup_failed").await;
                    return;
                }
            },
            Err(e) => {
                error!(
                    tenant = %self.tenant_id,
                    state = ?self.state,
                    error = %e,
                    "connect startup failed"
                );
                let _ = started_tx.send(Err(e));
                self.cleanup("startup_failed").await;
                return;
            }
        }

        let reason = self.serve(cmd_rx).await;
        self.cleanup(reason).await;
    }

    async fn startup(&mut self) -> Result<(), ConnectError> {
        for step in STARTUP_PIPELINE {
            self.run_step(step).await.map_err(|e| {
                error!(
                    tenant = %self.tenant_id,
                    step = step.name(),
                    error = %e,
                    "startup step failed"
                );
                e
            })?;
        }
        Ok(())
    }

    fn run_step(
        &mut self,
        step: Step,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), ConnectError>> + Send + '_>> {
        match step {
            Step::GetTenant => Box::pin(self.get_tenant()),
            Step::CheckConnection => Box::pin(self.check_connection()),
            Step::StartCounters => Box::pin(self.start_counters()),
            Step::RegisterProcess => Box::pin(self.register_process()),
            Step::RunMigrations => Box::pin(self.run_migrations()),
            Step::StartReplication => Box::pin(self.start_replication()),
            Step::PublishReady => Box::pin(self.publish_ready()),
            Step::SetupWatchdogs => Box::pin(self.setup_watchdogs()),
        }
    }

    async fn get_tenant(&mut self) -> Result<(), ConnectError> {
        let tenant = self
            .node
            .cache
            .get(&self.tenant_id)
            .await
            .map_err(|e| {
                error!(tenant = %self.tenant_id, error = %e, "tenant lookup failed");
                ConnectError::TenantDatabaseUnavailable
            })?
            .ok_or(ConnectError::TenantNotFound)?;

        if tenant.suspend {
            return Err(ConnectError::TenantSuspended);
        }
        self.tenant = Some(tenant);
        Ok(())
    }

    async fn check_connection(&mut self) -> Result<(), ConnectError> {
        let settings = self
            .tenant_ref()?
            .db_settings()
            .cloned()
            .ok_or(ConnectError::TenantDatabaseUnavailable)?;

        let pool = TenantPool::connect(
            settings,
            self.node.config.db_pool_size,
            self.node.config.db_checkout_timeout,
        )
        .await
        .map_err(|e| match e {
            PoolError::TooManyConnections => ConnectError::TenantDbTooManyConnections,
            _ => ConnectError::TenantDatabaseUnavailable,
        })?;

        self.pool = Some(pool);
        Ok(())
    }

    async fn start_counters(&mut self) -> Result<(), ConnectError> {
        for kind in [
            CounterKind::RequestsPerSecond,
            CounterKind::ChannelsPerClient,
            CounterKind::JoinsPerSecond,
            CounterKind::EventsPerSecond,
        ] {
            self.node.counters.add(&self.tenant_id, kind, 0);
        }
        Ok(())
    }

    async fn register_process(&mut self) -> Result<(), ConnectError> {
        let region = self.tenant_ref()?.region.clone();
        let process: Arc<dyn RegisteredProcess> = self.handle.clone();

        self.node
            .registry
            .register_connect(&self.tenant_id, process, ConnectMeta { conn: None, region })
            .map_err(|_| ConnectError::RegistrationConflict)
    }

    async fn run_migrations(&mut self) -> Result<(), ConnectError> {
        self.state = ConnectState::Migrating;
        let tenant = self.tenant_ref()?.clone();
        let pool = self.pool_ref()?.clone();

        self.node
            .migrator
            .run(&tenant, &pool)
            .await
            .map_err(|e| ConnectError::Migrations(e.to_string()))
    }

    async fn start_replication(&mut self) -> Result<(), ConnectError> {
        self.state = ConnectState::Replicating;
        let tenant = self.tenant_ref()?.clone();

        let adapter: Arc<dyn FanoutAdapter> = match tenant.broadcast_adapter {
            BroadcastAdapter::Local => Arc::new(LocalFanout::new(self.node.bus.clone())),
            BroadcastAdapter::Cluster => Arc::new(ClusterFanout::new(
                self.node.bus.clone(),
                self.node.registry.clone(),
                self.node.name.clone(),
                self.node.config.erpc_timeout,
            )),
        };

        let config = IngesterConfig {
            slot_name: self.node.config.replication_slot_name(),
            start_timeout: self.node.config.replication_start_timeout,
        };

        let handle = replication::start(
            tenant,
            adapter,
            self.node.metrics.clone(),
            config,
            self.monitored_tx.subscribe(),
        )
        .await
        .map_err(|e| match e {
            ReplicationError::MaxWalSendersReached => ConnectError::MaxWalSendersReached,
            other => ConnectError::Replication(other),
        })?;

        self.ingester = Some(handle);
        Ok(())
    }

    async fn publish_ready(&mut self) -> Result<(), ConnectError> {
        let region = self.tenant_ref()?.region.clone();
        let conn = Some(self.pool_ref()?.clone());

        self.node
            .registry
            .update_connect(&self.tenant_id, ConnectMeta { conn, region });
        Ok(())
    }

    async fn setup_watchdogs(&mut self) -> Result<(), ConnectError> {
        self.ops_rx = Some(
            self.node
                .bus
                .subscribe_events(&operations_topic(&self.tenant_id)),
        );
        self.state = ConnectState::Serving;
        info!(tenant = %self.tenant_id, "connect supervisor serving");
        Ok(())
    }

    async fn serve(&mut self, mut cmd_rx: mpsc::Receiver<Command>) -> &'static str {
        let Some(pool) = self.pool.clone() else {
            return "shutdown";
        };
        let Some(mut ingester) = self.ingester.take() else {
            return "shutdown";
        };
        let Some(mut ops_rx) = self.ops_rx.take() else {
            self.ingester = Some(ingester);
            return "shutdown";
        };

        let mut user_check = interval(self.node.config.check_connected_user_interval);
        user_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut region_check = interval(self.node.config.rebalance_check_interval);
        region_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Intervals fire immediately; the first real sample is one interval in
        user_check.tick().await;
        region_check.tick().await;

        let mut bucket = VecDeque::with_capacity(USER_COUNT_BUCKET_LEN);
        let mut shutdown_scheduled = false;
        let mut known_nodes = self.node.registry.all_nodes();

        let reason = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown(reason)) => break reason,
                    None => break "shutdown",
                },
                event = ops_rx.recv() => match event {
                    Ok(Event::SuspendTenant) => {
                        self.node.cache.invalidate(&self.tenant_id);
                        break "tenant_suspended";
                    }
                    Ok(Event::UnsuspendTenant) => {
                        self.node.cache.invalidate(&self.tenant_id);
                    }
                    Ok(Event::Disconnect) => break "disconnect",
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break "shutdown",
                },
                _ = user_check.tick() => {
                    let count = self.node.bus.connected_users(&self.tenant_id);
                    if idle_tick(&mut bucket, &mut shutdown_scheduled, count) {
                        break "shutdown_no_connected_users";
                    }
                },
                _ = region_check.tick() => {
                    if self.wrong_region(&mut known_nodes) {
                        break "rebalancing";
                    }
                },
                _ = pool.closed() => {
                    warn!(tenant = %self.tenant_id, "tenant db pool down");
                    break "shutdown";
                },
                _ = &mut ingester.join => {
                    warn!(tenant = %self.tenant_id, "replication ingester down");
                    break "shutdown";
                },
            }
        };

        self.ingester = Some(ingester);
        reason
    }

    /// A node-set change that leaves the tenant's preferred region with a
    /// different launch node means this supervisor should move.
    fn wrong_region(&self, known_nodes: &mut Vec<String>) -> bool {
        let nodes = self.node.registry.all_nodes();
        if nodes == *known_nodes {
            return false;
        }
        *known_nodes = nodes;

        let Some(tenant) = &self.tenant else {
            return false;
        };
        match self.node.registry.members(&tenant.region).first() {
            Some(preferred) if preferred != &self.node.name => {
                info!(
                    tenant = %self.tenant_id,
                    preferred = %preferred,
                    "connect supervisor in wrong region"
                );
                true
            }
            _ => false,
        }
    }

    async fn cleanup(&mut self, reason: &str) {
        self.state = ConnectState::ShuttingDown;
        let _ = self.monitored_tx.send(true);

        if let Some(mut ingester) = self.ingester.take() {
            ingester.stop();
            if !ingester.join.is_finished() {
                if timeout(Duration::from_secs(5), &mut ingester.join)
                    .await
                    .is_err()
                {
                    ingester.join.abort();
                }
            }
        }

        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }

        let process: Arc<dyn RegisteredProcess> = self.handle.clone();
        self.node.registry.unregister_connect(&self.tenant_id, &process);
        self.node.counters.cleanup(&self.tenant_id);
        self.node.metrics.connect_stopped();

        info!(tenant = %self.tenant_id, reason, "connect supervisor stopped");
    }

    fn tenant_ref(&self) -> Result<&Tenant, ConnectError> {
        self.tenant.as_ref().ok_or(ConnectError::TenantNotFound)
    }

    fn pool_ref(&self) -> Result<&PoolHandle, ConnectError> {
        self.pool
            .as_ref()
            .ok_or(ConnectError::TenantDatabaseUnavailable)
    }
}

/// One connected-user sample. Returns true when the supervisor should stop:
/// six consecutive zero samples schedule the shutdown, and one more zero
/// sample confirms it; any non-zero sample resets the schedule.
fn idle_tick(bucket: &mut VecDeque<usize>, scheduled: &mut bool, count: usize) -> bool {
    if bucket.len() == USER_COUNT_BUCKET_LEN {
        bucket.pop_front();
    }
    bucket.push_back(count);

    if *scheduled && count == 0 {
        return true;
    }
    *scheduled = bucket.len() == USER_COUNT_BUCKET_LEN && bucket.iter().all(|&c| c == 0);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::{DbExtension, MemoryTenantStore};

    struct NoopMigrator;

    #[async_trait]
    impl Migrator for NoopMigrator {
        async fn run(&self, _tenant: &Tenant, _pool: &PoolHandle) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_node(store: Arc<MemoryTenantStore>) -> Arc<Node> {
        let config = Config::from_env().unwrap();
        Node::new(config, store, Arc::new(NoopMigrator))
    }

    fn test_settings() -> DbExtension {
        DbExtension {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            db_name: "postgres".to_string(),
            poll_interval_ms: 100,
            ssl_enforced: false,
        }
    }

    fn test_tenant(id: &str, suspend: bool) -> Tenant {
        Tenant {
            external_id: id.to_string(),
            region: "us-east-1".to_string(),
            suspend,
            jwt_secret: "secret".to_string(),
            jwt_jwks: None,
            migrations_ran: 0,
            broadcast_adapter: Default::default(),
            extensions: vec![test_settings()],
        }
    }

    struct IdleProcess;

    #[async_trait]
    impl RegisteredProcess for IdleProcess {
        fn node(&self) -> &str {
            "node-a"
        }
        fn is_alive(&self) -> bool {
            true
        }
        async fn stop(&self, _grace: Duration) {}
    }

    #[test]
    fn test_error_code_roundtrip() {
        for error in [
            ConnectError::TenantNotFound,
            ConnectError::TenantSuspended,
            ConnectError::TenantDatabaseUnavailable,
            ConnectError::TenantDbTooManyConnections,
            ConnectError::Initializing,
            ConnectError::MaxWalSendersReached,
        ] {
            let code = error.as_code();
            assert_eq!(ConnectError::from_code(&code).as_code(), code);
        }

        assert!(matches!(
            ConnectError::from_code("something else"),
            ConnectError::Rpc(_)
        ));
    }

    #[test]
    fn test_idle_tick_requires_six_zeros_plus_one() {
        let mut bucket = VecDeque::new();
        let mut scheduled = false;

        for _ in 0..6 {
            assert!(!idle_tick(&mut bucket, &mut scheduled, 0));
        }
        assert!(scheduled);
        // One more zero interval confirms the shutdown
        assert!(idle_tick(&mut bucket, &mut scheduled, 0));
    }

    #[test]
    fn test_idle_tick_nonzero_resets_schedule() {
        let mut bucket = VecDeque::new();
        let mut scheduled = false;

        for _ in 0..6 {
            idle_tick(&mut bucket, &mut scheduled, 0);
        }
        assert!(scheduled);

        assert!(!idle_tick(&mut bucket, &mut scheduled, 3));
        assert!(!scheduled);

        // Needs six fresh zeros again before rescheduling
        for _ in 0..5 {
            assert!(!idle_tick(&mut bucket, &mut scheduled, 0));
        }
        assert!(!scheduled);
        assert!(!idle_tick(&mut bucket, &mut scheduled, 0));
        assert!(scheduled);
    }

    #[tokio::test]
    async fn test_lookup_unknown_tenant() {
        let node = test_node(Arc::new(MemoryTenantStore::new()));
        let result = node.lookup_or_start_connection("missing").await;
        assert!(matches!(result, Err(ConnectError::TenantNotFound)));
    }

    #[tokio::test]
    async fn test_lookup_suspended_tenant() {
        let store = Arc::new(MemoryTenantStore::new());
        store.upsert(test_tenant("t1", true));
        let node = test_node(store);

        let result = node.lookup_or_start_connection("t1").await;
        assert!(matches!(result, Err(ConnectError::TenantSuspended)));
    }

    #[tokio::test]
    async fn test_lookup_returns_registered_handle() {
        let node = test_node(Arc::new(MemoryTenantStore::new()));
        let pool = TenantPool::stub(test_settings());

        node.registry
            .register_connect(
                "t1",
                Arc::new(IdleProcess),
                ConnectMeta {
                    conn: Some(pool.clone()),
                    region: "us-east-1".to_string(),
                },
            )
            .unwrap();

        let found = node.lookup_or_start_connection("t1").await.unwrap();
        assert!(Arc::ptr_eq(&found, &pool));
    }

    #[tokio::test]
    async fn test_waiter_sees_ready_published_after_subscribe() {
        let node = test_node(Arc::new(MemoryTenantStore::new()));
        node.registry
            .register_connect(
                "t1",
                Arc::new(IdleProcess),
                ConnectMeta {
                    conn: None,
                    region: "us-east-1".to_string(),
                },
            )
            .unwrap();

        let publisher = node.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            publisher.registry.update_connect(
                "t1",
                ConnectMeta {
                    conn: Some(TenantPool::stub(test_settings())),
                    region: "us-east-1".to_string(),
                },
            );
        });

        let found = node.lookup_or_start_connection("t1").await;
        assert!(found.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_rereads_after_subscribing() {
        // The ready fired before the waiter arrived; the re-read after
        // subscribing must close the race.
        let node = test_node(Arc::new(MemoryTenantStore::new()));
        node.registry
            .register_connect(
                "t1",
                Arc::new(IdleProcess),
                ConnectMeta {
                    conn: None,
                    region: "us-east-1".to_string(),
                },
            )
            .unwrap();
        node.registry.update_connect(
            "t1",
            ConnectMeta {
                conn: Some(TenantPool::stub(test_settings())),
                region: "us-east-1".to_string(),
            },
        );

        let found = node.wait_for_connection("t1").await;
        assert!(found.is_ok());
    }

    #[tokio::test]
    async fn test_handle_start_connect_maps_error_codes() {
        let node = test_node(Arc::new(MemoryTenantStore::new()));
        let response = node
            .handle_start_connect(StartConnectRequest {
                tenant_id: "missing".to_string(),
                origin_node: "node-b".to_string(),
            })
            .await;

        assert_eq!(response.status, 1);
        assert_eq!(response.error_code, "tenant_not_found");
    }

    #[test]
    fn test_preferred_node_defaults_to_self() {
        let node = test_node(Arc::new(MemoryTenantStore::new()));
        assert_eq!(node.preferred_node("nowhere"), node.name);
        assert_eq!(node.preferred_node(&node.region.clone()), node.name);
    }
}
