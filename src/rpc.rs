//! Cluster RPC client
//!
//! Unary gRPC calls between nodes: starting a Connect supervisor on the
//! tenant's preferred node, and relaying replication fan-outs for tenants on
//! the cluster adapter. The server side belongs to the node's outer surface;
//! this module only speaks to it.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;
use tracing::warn;

use crate::bus::{Bus, Envelope};
use crate::registry::Registry;
use crate::replication::FanoutAdapter;

/// Ask a node to start (or confirm) the Connect supervisor for a tenant.
/// The tenant id doubles as the correlation tag in the remote node's logs.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StartConnectRequest {
    #[prost(string, tag = "1")]
    pub tenant_id: String,
    #[prost(string, tag = "2")]
    pub origin_node: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StartConnectResponse {
    /// 0 = started and ready, anything else = failed
    #[prost(int32, tag = "1")]
    pub status: i32,
    /// Error code from the remote node's failure taxonomy
    #[prost(string, tag = "2")]
    pub error_code: String,
}

/// Relay a pre-shaped fan-out frame to another node's bus.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RelayBroadcastRequest {
    #[prost(string, tag = "1")]
    pub topic: String,
    /// The envelope, JSON-encoded exactly as the local bus would encode it
    #[prost(string, tag = "2")]
    pub frame: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RelayBroadcastResponse {
    #[prost(int32, tag = "1")]
    pub delivered: i32,
}

/// Client for one remote node.
pub struct ClusterRpc {
    channel: Channel,
    timeout: Duration,
}

impl ClusterRpc {
    pub async fn connect(addr: &str, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = Endpoint::from_shared(normalize_rpc_addr(addr))?
            .connect_timeout(Duration::from_secs(5));
        let channel = endpoint
            .connect()
            .await
            .with_context(|| format!("failed to connect to cluster rpc at {addr}"))?;

        Ok(Self { channel, timeout })
    }

    pub async fn start_connect(
        &self,
        request: StartConnectRequest,
    ) -> anyhow::Result<StartConnectResponse> {
        self.unary(request, "/tenantcast.Cluster/StartConnect").await
    }

    pub async fn relay_broadcast(
        &self,
        request: RelayBroadcastRequest,
    ) -> anyhow::Result<RelayBroadcastResponse> {
        self.unary(request, "/tenantcast.Cluster/RelayBroadcast").await
    }

    async fn unary<Req, Res>(&self, message: Req, path: &'static str) -> anyhow::Result<Res>
    where
        Req: prost::Message + 'static,
        Res: prost::Message + Default + 'static,
    {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready().await.context("cluster rpc service not ready")?;
        let mut request = Request::new(message);
        request.set_timeout(self.timeout);
        let response = grpc
            .unary(request, PathAndQuery::from_static(path), ProstCodec::default())
            .await?
            .into_inner();
        Ok(response)
    }
}

fn normalize_rpc_addr(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

/// Fan out locally and relay to every other node in the cluster. Relays are
/// best-effort: a peer that cannot be reached is logged and skipped.
pub struct ClusterFanout {
    bus: Arc<Bus>,
    registry: Arc<Registry>,
    self_node: String,
    rpc_timeout: Duration,
    clients: DashMap<String, Arc<ClusterRpc>>,
}

impl ClusterFanout {
    pub fn new(
        bus: Arc<Bus>,
        registry: Arc<Registry>,
        self_node: String,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            registry,
            self_node,
            rpc_timeout,
            clients: DashMap::new(),
        }
    }

    async fn client_for(&self, node: &str) -> Option<Arc<ClusterRpc>> {
        if let Some(client) = self.clients.get(node) {
            return Some(client.clone());
        }

        let addr = self.registry.node_addr(node)?;
        match ClusterRpc::connect(&addr, self.rpc_timeout).await {
            Ok(client) => {
                let client = Arc::new(client);
                self.clients.insert(node.to_string(), client.clone());
                Some(client)
            }
            Err(e) => {
                warn!(node, error = %e, "cluster fanout peer unreachable");
                None
            }
        }
    }
}

#[async_trait]
impl FanoutAdapter for ClusterFanout {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> usize {
        let mut delivered = self.bus.publish(topic, envelope, None);

        let frame = envelope.encode();
        for node in self.registry.all_nodes() {
            if node == self.self_node {
                continue;
            }
            let Some(client) = self.client_for(&node).await else {
                continue;
            };
            let request = RelayBroadcastRequest {
                topic: topic.to_string(),
                frame: frame.to_string(),
            };
            match client.relay_broadcast(request).await {
                Ok(response) => delivered += response.delivered as usize,
                Err(e) => {
                    // Drop the cached client so the next publish reconnects
                    self.clients.remove(&node);
                    warn!(node = %node, error = %e, "cluster fanout relay failed");
                }
            }
        }

        delivered
    }
}
