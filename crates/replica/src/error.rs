//! Error taxonomy of the replication layer.

use lattice_common::{PartitionId, TransactionId};
use lattice_hlc::HlcTimestamp;
use thiserror::Error;

/// Failure of a replica invocation.
///
/// The finish protocol dispatches on the kind: recoverable failures are
/// retried with the same request, terminal ones propagate, and
/// `TransactionAlreadyAborted` is adopted as the local truth.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error("request to node {node} timed out")]
    Timeout { node: String },

    #[error("i/o failure talking to node {node}: {message}")]
    Io { node: String, message: String },

    #[error("replication timed out in group {group}")]
    ReplicationTimeout { group: PartitionId },

    #[error("node {node} is not the primary replica of group {group}")]
    PrimaryReplicaMiss { node: String, group: PartitionId },

    #[error("transaction {tx_id} was already aborted")]
    TransactionAlreadyAborted { tx_id: TransactionId },

    #[error("replica failure: {0}")]
    Internal(String),
}

impl ReplicaError {
    /// Whether re-sending the same request may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReplicaError::Timeout { .. }
                | ReplicaError::Io { .. }
                | ReplicaError::ReplicationTimeout { .. }
                | ReplicaError::PrimaryReplicaMiss { .. }
        )
    }
}

/// Failure to resolve a primary replica.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("no primary replica appeared for group {group} by timestamp {at}")]
    AwaitTimeout { group: PartitionId, at: HlcTimestamp },
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_hlc::NodeId;

    #[test]
    fn recoverable_classification_is_closed() {
        let group = PartitionId::new(1, 0);
        let tx_id = lattice_common::TransactionId::new(
            HlcTimestamp::new(1, 0, NodeId::new(1)),
            0,
        );

        assert!(ReplicaError::Timeout { node: "n1".into() }.is_recoverable());
        assert!(ReplicaError::Io {
            node: "n1".into(),
            message: "reset".into()
        }
        .is_recoverable());
        assert!(ReplicaError::ReplicationTimeout { group }.is_recoverable());
        assert!(ReplicaError::PrimaryReplicaMiss {
            node: "n1".into(),
            group
        }
        .is_recoverable());

        assert!(!ReplicaError::TransactionAlreadyAborted { tx_id }.is_recoverable());
        assert!(!ReplicaError::Internal("boom".into()).is_recoverable());
    }
}
