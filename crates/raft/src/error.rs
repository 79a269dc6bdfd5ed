//! Error kinds surfaced by the consensus adapter.

use std::time::Duration;
use thiserror::Error;

/// Failures of consensus-level operations.
///
/// Domain rejections are not errors at this layer: they travel inside
/// the command's [`domain::CommandResponse`].
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// The write reached a follower. Carries the last known leader so
    /// the client can retry there.
    #[error("not the leader{}", leader_hint(.leader_id, .leader_addr))]
    NotLeader {
        leader_id: Option<u64>,
        leader_addr: Option<String>,
    },

    /// The entry did not commit and apply within the deadline. The
    /// outcome is unknown; it may still commit later.
    #[error("apply timed out after {0:?}")]
    Timeout(Duration),

    /// The node is shutting down and no longer accepts proposals.
    #[error("consensus node is shutting down")]
    Shutdown,

    #[error("consensus failure: {0}")]
    Internal(String),
}

fn leader_hint(id: &Option<u64>, addr: &Option<String>) -> String {
    match (id, addr) {
        (Some(id), Some(addr)) => format!(" (leader: node {id} at {addr})"),
        (Some(id), None) => format!(" (leader: node {id})"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_message_includes_hint() {
        let err = ConsensusError::NotLeader {
            leader_id: Some(1),
            leader_addr: Some("127.0.0.1:7001".into()),
        };
        assert_eq!(
            err.to_string(),
            "not the leader (leader: node 1 at 127.0.0.1:7001)"
        );

        let err = ConsensusError::NotLeader {
            leader_id: None,
            leader_addr: None,
        };
        assert_eq!(err.to_string(), "not the leader");
    }
}
