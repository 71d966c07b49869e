//! Logical request and response contracts exchanged with replicas.
//!
//! These describe the payloads only; the wire encoding belongs to the
//! network layer and is out of scope here.

use lattice_common::{LeaseToken, PartitionId, TransactionId};
use lattice_hlc::HlcTimestamp;
use serde::{Deserialize, Serialize};

/// Request asking the commit partition to durably record a transaction
/// outcome across the whole replication group set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxFinishRequest {
    pub tx_id: TransactionId,
    /// The partition anchoring the durable decision.
    pub commit_partition: PartitionId,
    pub commit: bool,
    /// Present only when committing.
    pub commit_timestamp: Option<HlcTimestamp>,
    /// Every replication group the transaction enlisted.
    pub groups: Vec<PartitionId>,
    /// Lease term of the commit partition's primary this request targets.
    pub term: LeaseToken,
    /// Coordinator clock at send time, for receiver-side clock propagation.
    pub timestamp: HlcTimestamp,
}

/// Request asking one partition to release locks and write intents left by
/// a finished transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxCleanupRequest {
    pub group: PartitionId,
    pub tx_id: TransactionId,
    pub commit: bool,
    pub commit_timestamp: Option<HlcTimestamp>,
    pub timestamp: HlcTimestamp,
}

/// A typed request addressed to a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRequest {
    Finish(TxFinishRequest),
    Cleanup(TxCleanupRequest),
}

impl ReplicaRequest {
    pub fn tx_id(&self) -> TransactionId {
        match self {
            ReplicaRequest::Finish(request) => request.tx_id,
            ReplicaRequest::Cleanup(request) => request.tx_id,
        }
    }
}

/// Successful acknowledgement of a replica request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaResponse {
    pub tx_id: TransactionId,
}
