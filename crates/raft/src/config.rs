//! Consensus node configuration.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one node of the replicated store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Per-node data directory holding the log, state file, and
    /// snapshots.
    pub data_dir: PathBuf,

    /// Address this node binds and advertises for Raft RPCs
    /// (e.g. "127.0.0.1:7000").
    pub raft_addr: String,

    /// Whether to seed a new single-node cluster on first start.
    pub bootstrap: bool,

    /// How long a submitted command may wait for commit-and-apply.
    pub apply_timeout: Duration,

    /// Snapshot once this many entries accumulate since the last one.
    pub snapshot_threshold: u64,

    /// Also snapshot on this periodic timer, whichever fires first.
    pub snapshot_interval: Duration,

    /// How many snapshot generations to keep on disk.
    pub snapshot_retention: usize,

    /// Election timeout range in milliseconds.
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            data_dir: PathBuf::from("./data/node-1"),
            raft_addr: "127.0.0.1:7000".to_string(),
            bootstrap: false,
            apply_timeout: Duration::from_secs(5),
            snapshot_threshold: 100,
            snapshot_interval: Duration::from_secs(30),
            snapshot_retention: 3,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: NodeId, data_dir: PathBuf) -> Self {
        Self {
            node_id,
            data_dir,
            ..Default::default()
        }
    }

    pub fn with_raft_addr(mut self, addr: impl Into<String>) -> Self {
        self.raft_addr = addr.into();
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    pub fn with_snapshot_cadence(mut self, threshold: u64, interval: Duration) -> Self {
        self.snapshot_threshold = threshold;
        self.snapshot_interval = interval;
        self
    }

    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    /// Path to the append-only Raft log file.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("raft.log")
    }

    /// Path to the vote/commit state file.
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("raft_state.json")
    }

    /// Path to the snapshot directory.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Build the openraft config from this node config.
    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            election_timeout_min: self.election_timeout_min_ms,
            election_timeout_max: self.election_timeout_max_ms,
            heartbeat_interval: self.heartbeat_interval_ms,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_in_snapshot_log_to_keep: 0,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.apply_timeout, Duration::from_secs(5));
        assert_eq!(config.snapshot_threshold, 100);
        assert_eq!(config.snapshot_retention, 3);
        assert!(!config.bootstrap);
    }

    #[test]
    fn builder_pattern() {
        let config = NodeConfig::new(3, PathBuf::from("/var/print/node-3"))
            .with_raft_addr("0.0.0.0:7003")
            .with_bootstrap(true)
            .with_apply_timeout(Duration::from_secs(2))
            .with_snapshot_cadence(10, Duration::from_secs(5));

        assert_eq!(config.node_id, 3);
        assert_eq!(config.raft_addr, "0.0.0.0:7003");
        assert!(config.bootstrap);
        assert_eq!(config.snapshot_threshold, 10);
    }

    #[test]
    fn paths() {
        let config = NodeConfig::new(1, PathBuf::from("/data/node-1"));
        assert_eq!(config.log_path(), PathBuf::from("/data/node-1/raft.log"));
        assert_eq!(
            config.state_path(),
            PathBuf::from("/data/node-1/raft_state.json")
        );
        assert_eq!(
            config.snapshot_dir(),
            PathBuf::from("/data/node-1/snapshots")
        );
    }
}
