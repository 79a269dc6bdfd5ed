//! HTTP transport between Raft peers.
//!
//! Peer addresses come from the membership config itself: every
//! `BasicNode` carries its Raft RPC address, so nodes added at runtime
//! via join are immediately reachable without a static peer table.
//!
//! All three RPC kinds funnel through [`HttpNetwork::send_rpc`], which
//! owns the request/response plumbing, the failure classification, and
//! the mapping into the consensus library's `RPCError`.

use crate::type_config::TypeConfig;
use crate::NodeId;
use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use std::io;
use std::time::Duration;
use tracing::debug;

/// Network send timeout for a single RPC.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Pooled idle connections kept per peer.
const POOL_SIZE: usize = 3;

/// Factory producing one [`HttpNetwork`] per peer, sharing a pooled
/// reqwest client.
#[derive(Clone)]
pub struct HttpNetworkFactory {
    client: reqwest::Client,
}

impl HttpNetworkFactory {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(POOL_SIZE)
            .build()
            .expect("reqwest client construction only fails on TLS backend misconfiguration");
        Self { client }
    }
}

impl Default for HttpNetworkFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HttpNetworkFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNetworkFactory").finish()
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpNetwork;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        HttpNetwork {
            target,
            base_url: format!("http://{}", node.addr),
            client: self.client.clone(),
        }
    }
}

/// HTTP client for one Raft peer.
#[derive(Clone)]
pub struct HttpNetwork {
    target: NodeId,
    base_url: String,
    client: reqwest::Client,
}

impl HttpNetwork {
    /// Send one RPC to the peer's `/raft/{rpc}` endpoint.
    ///
    /// Every failure mode — refused connection, non-success status,
    /// undecodable body — surfaces as `Unreachable`, which tells the
    /// consensus core to back off and retry rather than treat the peer
    /// as having answered.
    async fn send_rpc<Req, Resp, E>(
        &self,
        rpc: &'static str,
        request: &Req,
    ) -> Result<Resp, RPCError<NodeId, BasicNode, E>>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
        E: std::error::Error,
    {
        let url = format!("{}/raft/{}", self.base_url, rpc);

        let outcome = async {
            let response = self
                .client
                .post(&url)
                .json(request)
                .send()
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(io::Error::other(format!("HTTP {status}: {body}")));
            }

            response
                .json::<Resp>()
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        }
        .await;

        outcome.map_err(|e| {
            debug!(peer = self.target, rpc, error = %e, "peer RPC failed");
            RPCError::Unreachable(Unreachable::new(&e))
        })
    }
}

impl std::fmt::Debug for HttpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNetwork")
            .field("target", &self.target)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl RaftNetwork<TypeConfig> for HttpNetwork {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.send_rpc("append_entries", &req).await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.send_rpc("install_snapshot", &req).await
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.send_rpc("vote", &req).await
    }
}
