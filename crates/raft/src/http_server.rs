//! HTTP server for inter-node Raft RPCs.
//!
//! Every node listens on its configured Raft address and answers
//! AppendEntries, Vote, and InstallSnapshot from its peers, plus a
//! `/health` probe exposing the node's consensus progress. RPC
//! failures are folded into the [`ConsensusError`] taxonomy and served
//! in the same `{"error": ...}` JSON shape the public gateway uses.

use crate::error::ConsensusError;
use crate::type_config::TypeConfig;
use crate::{NodeId, RaftNode};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::warn;

/// Shared state for the RPC handlers.
#[derive(Clone)]
pub struct RpcState {
    raft: Arc<RaftNode>,
}

impl RpcState {
    pub fn new(raft: Arc<RaftNode>) -> Self {
        Self { raft }
    }
}

/// Build the Raft RPC router.
pub fn rpc_router(state: RpcState) -> Router {
    Router::new()
        .route("/raft/append_entries", post(append_entries))
        .route("/raft/vote", post(vote))
        .route("/raft/install_snapshot", post(install_snapshot))
        .route("/health", get(health).post(health))
        .with_state(state)
}

/// Fold one RPC outcome into a response.
///
/// All three Raft RPCs share this path: a success is the library's
/// response serialized as-is, a failure becomes a typed
/// [`ConsensusError::Internal`] rather than an ad hoc string body.
fn rpc_response<T: Serialize>(
    rpc: &'static str,
    outcome: Result<T, impl std::fmt::Display>,
) -> Response {
    match outcome {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e) => {
            let err = ConsensusError::Internal(format!("{rpc}: {e}"));
            warn!(rpc, error = %err, "raft RPC failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn append_entries(
    State(state): State<RpcState>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Response {
    rpc_response("append_entries", state.raft.append_entries(req).await)
}

async fn vote(State(state): State<RpcState>, Json(req): Json<VoteRequest<NodeId>>) -> Response {
    rpc_response("vote", state.raft.vote(req).await)
}

async fn install_snapshot(
    State(state): State<RpcState>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Response {
    rpc_response("install_snapshot", state.raft.install_snapshot(req).await)
}

/// Liveness probe with the node's consensus progress, mirroring the
/// field names of the gateway's `/cluster` endpoint.
async fn health(State(state): State<RpcState>) -> Json<serde_json::Value> {
    let metrics = state.raft.metrics().borrow().clone();
    Json(serde_json::json!({
        "node_id": metrics.id,
        "state": format!("{:?}", metrics.state),
        "leader_id": metrics.current_leader,
        "term": metrics.current_term,
        "last_log_index": metrics.last_log_index,
        "last_applied": metrics.last_applied.map(|l| l.index),
    }))
}

/// Bind the RPC listener and serve until [`RpcServerHandle::stop`].
pub async fn start_rpc_server(
    addr: SocketAddr,
    state: RpcState,
) -> Result<RpcServerHandle, std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, rpc_router(state))
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    Ok(RpcServerHandle {
        local_addr,
        shutdown_tx,
        task,
    })
}

/// Handle for the running RPC server.
pub struct RpcServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    task: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl RpcServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal graceful shutdown and wait for the listener to drain.
    pub async fn stop(self) -> Result<(), std::io::Error> {
        let _ = self.shutdown_tx.send(());
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(format!(
                "RPC server task panicked: {e}"
            ))),
        }
    }
}
