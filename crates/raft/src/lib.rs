//! Consensus adapter for the replicated print workflow store.
//!
//! This crate is the only one that knows the consensus library's
//! concrete types. It wires the deterministic state machine
//! ([`fsm::PrintFsm`]) into OpenRaft through durable storage, HTTP
//! transport between peers, and the [`ConsensusNode`] facade the
//! request gateway calls.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Store Node                            │
//! │  ┌───────────┐    ┌───────────────┐    ┌─────────────────┐   │
//! │  │  Gateway  │───▶│ ConsensusNode │───▶│ PersistentStore │   │
//! │  │ (/api/v1) │    │               │    │  (log + state)  │   │
//! │  └───────────┘    └───────┬───────┘    └────────┬────────┘   │
//! │        │                  │                     ▼            │
//! │        │ local reads      │ RPC          ┌────────────┐      │
//! │        └─────────────────────────────────▶│  PrintFsm  │     │
//! │                           ▼               └────────────┘     │
//! │                   ┌──────────────┐                           │
//! │                   │ axum /raft/* │◀──── peers                │
//! │                   └──────────────┘                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: per-node configuration (addresses, cadence, timeouts)
//! - [`error`]: the consensus error taxonomy
//! - [`http_server`]: axum endpoints for inter-node Raft RPCs
//! - [`network`]: reqwest transport resolving peers from membership
//! - [`node`]: the [`ConsensusNode`] facade
//! - [`storage`]: durable log, vote/commit state, and snapshots
//! - [`type_config`]: OpenRaft type bindings

pub mod config;
pub mod error;
pub mod http_server;
pub mod network;
pub mod node;
pub mod storage;
pub mod type_config;

pub use config::NodeConfig;
pub use error::ConsensusError;
pub use http_server::{rpc_router, start_rpc_server, RpcServerHandle, RpcState};
pub use network::{HttpNetwork, HttpNetworkFactory};
pub use node::{ClusterStatus, ConsensusNode};
pub use storage::{PersistentStore, SharedStore};
pub use type_config::TypeConfig;

/// The Raft handle type for this store.
pub type RaftNode = openraft::Raft<TypeConfig>;

/// Node identifier type.
pub type NodeId = u64;
