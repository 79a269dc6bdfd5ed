//! OpenRaft type configuration.
//!
//! Binds the generic consensus types to this system's command model:
//! log entries carry [`Command`]s, application yields
//! [`CommandResponse`]s, and peers are `BasicNode`s whose `addr` is the
//! node's Raft RPC endpoint.

use crate::NodeId;
use domain::{Command, CommandResponse};
use openraft::BasicNode;
use std::io::Cursor;

openraft::declare_raft_types!(
    /// Raft type configuration for the print workflow store.
    pub TypeConfig:
        D = Command,
        R = CommandResponse,
        NodeId = NodeId,
        Node = BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
);

/// Type alias for log entries.
pub type Entry = openraft::Entry<TypeConfig>;

/// Type alias for log IDs.
pub type LogId = openraft::LogId<NodeId>;

/// Type alias for votes.
pub type Vote = openraft::Vote<NodeId>;

/// Type alias for snapshot metadata.
pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, BasicNode>;

/// Type alias for membership config.
pub type Membership = openraft::Membership<NodeId, BasicNode>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_config_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TypeConfig>();
    }
}
