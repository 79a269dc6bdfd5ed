//! The consensus node facade.
//!
//! [`ConsensusNode`] is the one surface the gateway talks to: submit a
//! command, ask who leads, grow the cluster, shut down. Everything
//! openraft-specific stays behind it.

use crate::config::NodeConfig;
use crate::error::ConsensusError;
use crate::http_server::{start_rpc_server, RpcServerHandle, RpcState};
use crate::network::HttpNetworkFactory;
use crate::storage::PersistentStore;
use crate::type_config::TypeConfig;
use crate::{NodeId, RaftNode};

use anyhow::Context;
use domain::{Command, CommandResponse};
use fsm::PrintFsm;
use openraft::error::{ClientWriteError, Fatal, RaftError};
use openraft::storage::Adaptor;
use openraft::{BasicNode, ChangeMembers, Raft};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A point-in-time view of the node's consensus role, served by the
/// gateway's `/cluster` endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct ClusterStatus {
    pub node_id: NodeId,
    pub leader_id: Option<NodeId>,
    pub leader_addr: Option<String>,
    pub is_leader: bool,
    pub state: String,
    pub term: u64,
    pub last_log_index: Option<u64>,
    pub last_applied: Option<u64>,
    /// Raft addresses of every member, keyed by node id.
    pub nodes: BTreeMap<NodeId, String>,
}

/// One replica of the replicated store.
pub struct ConsensusNode {
    node_id: NodeId,
    raft_addr: String,
    apply_timeout: Duration,
    raft: RaftNode,
    fsm: Arc<PrintFsm>,
    rpc_server: Mutex<Option<RpcServerHandle>>,
    snapshot_ticker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConsensusNode {
    /// Open storage, start the Raft RPC listener, and join consensus.
    ///
    /// When `config.bootstrap` is set and the data directory is fresh,
    /// a new single-node cluster is seeded and this node elects itself;
    /// on a restart the existing cluster state is resumed instead.
    pub async fn start(config: NodeConfig, fsm: Arc<PrintFsm>) -> anyhow::Result<Self> {
        let is_restart = config.state_path().exists();

        let store = PersistentStore::open(&config.data_dir, config.snapshot_retention, fsm.clone())
            .with_context(|| {
                format!("failed to open raft storage in {}", config.data_dir.display())
            })?;
        let (log_store, state_machine) = Adaptor::<TypeConfig, _>::new(store);

        let raft_config = Arc::new(config.to_openraft_config());
        let network = HttpNetworkFactory::new();

        let raft = Raft::<TypeConfig>::new(
            config.node_id,
            raft_config,
            network,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to create raft node: {e}"))?;

        let bind_addr: SocketAddr = config
            .raft_addr
            .parse()
            .with_context(|| format!("invalid raft address '{}'", config.raft_addr))?;
        let rpc_server = start_rpc_server(bind_addr, RpcState::new(Arc::new(raft.clone())))
            .await
            .with_context(|| format!("failed to bind raft listener on {bind_addr}"))?;

        // Peers dial what membership advertises; when the bind port was
        // ephemeral, advertise the port the listener actually got.
        let raft_addr = if bind_addr.port() == 0 {
            rpc_server.local_addr().to_string()
        } else {
            config.raft_addr.clone()
        };

        if config.bootstrap && !is_restart {
            let mut members = BTreeMap::new();
            members.insert(config.node_id, BasicNode::new(&raft_addr));
            raft.initialize(members)
                .await
                .map_err(|e| anyhow::anyhow!("failed to bootstrap cluster: {e}"))?;
            Self::wait_for_leader(&raft, config.node_id).await?;
            info!(node_id = config.node_id, "bootstrapped single-node cluster");
        } else if is_restart {
            info!(node_id = config.node_id, "resuming existing cluster state");
            // Non-fatal: on a multi-node restart the election may need
            // peers that have not come back yet.
            for _ in 0..200 {
                if raft.metrics().borrow().current_leader.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        let ticker = spawn_snapshot_ticker(raft.clone(), config.snapshot_interval);

        Ok(Self {
            node_id: config.node_id,
            raft_addr,
            apply_timeout: config.apply_timeout,
            raft,
            fsm,
            rpc_server: Mutex::new(Some(rpc_server)),
            snapshot_ticker: Mutex::new(Some(ticker)),
        })
    }

    /// Wait for this node to become leader (or time out).
    async fn wait_for_leader(raft: &RaftNode, expected: NodeId) -> anyhow::Result<()> {
        for _ in 0..200 {
            let metrics = raft.metrics().borrow().clone();
            if metrics.current_leader == Some(expected) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!("timeout waiting for node {expected} to become leader")
    }

    /// Submit one command and wait for it to commit and apply locally.
    ///
    /// A [`CommandResponse::Rejected`] is a successful apply whose
    /// result is a domain rejection; consensus-level failures come back
    /// as [`ConsensusError`]. On timeout the outcome is unknown: the
    /// entry may still commit.
    pub async fn apply(&self, cmd: Command) -> Result<CommandResponse, ConsensusError> {
        match timeout(self.apply_timeout, self.raft.client_write(cmd)).await {
            Err(_elapsed) => Err(ConsensusError::Timeout(self.apply_timeout)),
            Ok(Ok(response)) => Ok(response.data),
            Ok(Err(err)) => Err(self.map_write_error(err)),
        }
    }

    fn map_write_error(
        &self,
        err: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>,
    ) -> ConsensusError {
        match err {
            RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => {
                ConsensusError::NotLeader {
                    leader_id: fwd.leader_id,
                    leader_addr: fwd.leader_node.map(|n| n.addr),
                }
            }
            RaftError::APIError(e) => ConsensusError::Internal(e.to_string()),
            RaftError::Fatal(Fatal::Stopped) => ConsensusError::Shutdown,
            RaftError::Fatal(f) => ConsensusError::Internal(f.to_string()),
        }
    }

    /// Add a voting member. Idempotent: a server already present under
    /// the same id or address succeeds without a membership change.
    pub async fn add_voter(&self, id: NodeId, addr: String) -> Result<(), ConsensusError> {
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config.membership().clone();

        let known = membership
            .nodes()
            .any(|(member_id, node)| *member_id == id || node.addr == addr);
        let is_voter = membership.voter_ids().any(|v| v == id);
        if known && is_voter {
            debug!(id, %addr, "join request for existing voter, nothing to do");
            return Ok(());
        }

        if !known {
            self.raft
                .add_learner(id, BasicNode::new(&addr), true)
                .await
                .map_err(|e| self.map_write_error(e))?;
        }

        self.raft
            .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
            .await
            .map_err(|e| self.map_write_error(e))?;

        info!(id, %addr, "voter added to cluster");
        Ok(())
    }

    /// Whether this node currently leads.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    /// The last known leader's Raft address, empty during elections.
    pub fn leader_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader_id = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader_id)
            .map(|n| n.addr.clone())
    }

    /// Snapshot of the node's consensus role and progress.
    pub fn status(&self) -> ClusterStatus {
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config.membership().clone();

        let leader_addr = metrics
            .current_leader
            .and_then(|id| membership.get_node(&id).map(|n| n.addr.clone()));

        ClusterStatus {
            node_id: self.node_id,
            leader_id: metrics.current_leader,
            leader_addr,
            is_leader: metrics.current_leader == Some(self.node_id),
            state: format!("{:?}", metrics.state),
            term: metrics.current_term,
            last_log_index: metrics.last_log_index,
            last_applied: metrics.last_applied.map(|l| l.index),
            nodes: membership
                .nodes()
                .map(|(id, node)| (*id, node.addr.clone()))
                .collect(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn raft_addr(&self) -> &str {
        &self.raft_addr
    }

    /// The state machine this node replicates into. Reads served from
    /// here are local: fresh on the leader, possibly stale elsewhere.
    pub fn fsm(&self) -> &Arc<PrintFsm> {
        &self.fsm
    }

    /// Ask the consensus core to cut a snapshot now.
    pub async fn trigger_snapshot(&self) -> Result<(), ConsensusError> {
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| ConsensusError::Internal(e.to_string()))
    }

    /// Stop the node: no new proposals, drain in-flight applies, stop
    /// the RPC listener and the snapshot ticker.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(ticker) = self.snapshot_ticker.lock().await.take() {
            ticker.abort();
        }

        self.raft
            .shutdown()
            .await
            .map_err(|e| anyhow::anyhow!("raft shutdown failed: {e}"))?;

        if let Some(server) = self.rpc_server.lock().await.take() {
            if let Err(e) = server.stop().await {
                warn!(error = %e, "raft RPC server exited with error");
            }
        }

        info!(node_id = self.node_id, "consensus node stopped");
        Ok(())
    }
}

/// Periodic snapshot trigger, complementing the log-threshold policy.
fn spawn_snapshot_ticker(raft: RaftNode, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = raft.trigger().snapshot().await {
                debug!(error = %e, "periodic snapshot trigger failed");
            }
        }
    })
}
