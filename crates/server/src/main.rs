//! Node binary for the replicated 3D-print workflow store.
//!
//! To run a 3-node cluster locally:
//!
//! ```bash
//! # Terminal 1 - bootstrap node
//! cargo run -p server -- --id 1 --http 127.0.0.1:8001 --raft 127.0.0.1:7001 \
//!     --data ./data --bootstrap
//!
//! # Terminal 2 - joins via node 1's HTTP address
//! cargo run -p server -- --id 2 --http 127.0.0.1:8002 --raft 127.0.0.1:7002 \
//!     --data ./data --join 127.0.0.1:8001
//!
//! # Terminal 3
//! cargo run -p server -- --id 3 --http 127.0.0.1:8003 --raft 127.0.0.1:7003 \
//!     --data ./data --join 127.0.0.1:8001
//! ```
//!
//! `NODE_ID` overrides `--id`; `PORT_OFFSET` shifts both bind ports,
//! which keeps multi-instance dev configs copy-pasteable.

use anyhow::{bail, Context, Result};
use api::AppState;
use clap::Parser;
use fsm::PrintFsm;
use raft::{ConsensusNode, NodeConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "printd", about = "Replicated 3D-print workflow store node")]
struct Args {
    /// Node ID, unique within the cluster
    #[arg(long, env = "NODE_ID")]
    id: u64,

    /// HTTP API bind address
    #[arg(long, default_value = "127.0.0.1:8000")]
    http: String,

    /// Raft RPC bind address, also advertised to peers
    #[arg(long, default_value = "127.0.0.1:7000")]
    raft: String,

    /// Base data directory; this node stores under <data>/node-<id>/
    #[arg(long, default_value = "./data")]
    data: PathBuf,

    /// Seed a new single-node cluster in a fresh data directory
    #[arg(long)]
    bootstrap: bool,

    /// HTTP address of an existing node to join on startup
    #[arg(long)]
    join: Option<String>,
}

/// Shift the port of `addr` by `offset`.
fn offset_addr(addr: &str, offset: u16) -> Result<String> {
    if offset == 0 {
        return Ok(addr.to_string());
    }
    let parsed: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid bind address '{addr}'"))?;
    let port = parsed
        .port()
        .checked_add(offset)
        .with_context(|| format!("port offset {offset} overflows address '{addr}'"))?;
    Ok(SocketAddr::new(parsed.ip(), port).to_string())
}

fn port_offset() -> Result<u16> {
    match std::env::var("PORT_OFFSET") {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid PORT_OFFSET '{raw}'")),
        Err(_) => Ok(0),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.bootstrap && args.join.is_some() {
        bail!("cannot both bootstrap and join");
    }

    let offset = port_offset()?;
    let http_addr = offset_addr(&args.http, offset)?;
    let raft_addr = offset_addr(&args.raft, offset)?;

    let node_dir = args.data.join(format!("node-{}", args.id));
    std::fs::create_dir_all(&node_dir)
        .with_context(|| format!("failed to create data directory {}", node_dir.display()))?;

    let fsm = Arc::new(PrintFsm::new());
    let config = NodeConfig::new(args.id, node_dir)
        .with_raft_addr(&raft_addr)
        .with_bootstrap(args.bootstrap);
    let node = Arc::new(ConsensusNode::start(config, fsm).await?);

    let listener = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {http_addr}"))?;
    let router = api::router(AppState::new(node.clone()));

    info!(
        node_id = args.id,
        %http_addr,
        %raft_addr,
        is_leader = node.is_leader(),
        "node listening"
    );

    if let Some(join_addr) = args.join.clone() {
        let node_id = args.id;
        let self_raft_addr = raft_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = join_cluster(&join_addr, node_id, &self_raft_addr).await {
                error!(error = %e, "failed to join cluster");
                std::process::exit(1);
            }
        });
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("shutdown signal received, stopping node");
    node.shutdown().await?;
    info!("shutdown complete");
    Ok(())
}

/// Ask an existing node to add us as a voter. The peer may still be
/// electing a leader when we come up, so the request is retried a few
/// times before giving up.
async fn join_cluster(join_addr: &str, node_id: u64, raft_addr: &str) -> Result<()> {
    // Give our own Raft listener a moment to come up before the leader
    // starts replicating to us.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let url = format!("http://{join_addr}/api/v1/join");
    let body = serde_json::json!({ "node_id": node_id, "addr": raft_addr });
    let client = reqwest::Client::new();

    let mut last_err = None;
    for attempt in 1..=5u32 {
        match client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                info!(%join_addr, "joined cluster");
                return Ok(());
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                last_err = Some(anyhow::anyhow!("join rejected with {status}: {text}"));
            }
            Err(e) => last_err = Some(e.into()),
        }
        info!(attempt, %join_addr, "join not accepted yet, retrying");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("join failed")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
