//! Error types for the transaction manager.

use lattice_common::{LeaseToken, PartitionId, TransactionId, TxState};
use lattice_hlc::HlcTimestamp;
use lattice_replica::ReplicaError;
use thiserror::Error;

/// Transaction manager error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxnError {
    #[error("transaction {tx_id} is already finishing or finished (state {state:?})")]
    AlreadyFinished {
        tx_id: TransactionId,
        state: TxState,
    },

    #[error(
        "read timestamp {read_timestamp} must be greater than the low watermark {low_watermark}"
    )]
    ReadTimestampTooOld {
        read_timestamp: HlcTimestamp,
        low_watermark: HlcTimestamp,
    },

    #[error(
        "primary replica of group {group} expired or changed: enlisted token {token}, \
         commit timestamp {commit_timestamp}"
    )]
    PrimaryReplicaExpired {
        group: PartitionId,
        token: LeaseToken,
        commit_timestamp: HlcTimestamp,
    },

    #[error("no primary replica available for group {group}")]
    ReplicaUnavailable { group: PartitionId },

    #[error("transaction {tx_id} was aborted")]
    Aborted { tx_id: TransactionId },

    #[error("transaction manager is stopping")]
    Stopping,

    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

impl TxnError {
    /// Whether the finish protocol may retry the same request after this
    /// failure.
    pub(crate) fn finish_retryable(&self) -> bool {
        match self {
            TxnError::ReplicaUnavailable { .. } => true,
            TxnError::Replica(error) => error.is_recoverable(),
            _ => false,
        }
    }
}

/// Result type for transaction manager operations.
pub type Result<T> = std::result::Result<T, TxnError>;
