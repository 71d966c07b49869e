//! Replication group identity and lease tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a replication group: one partition of one table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PartitionId {
    pub table_id: u32,
    pub partition: u32,
}

impl PartitionId {
    pub const fn new(table_id: u32, partition: u32) -> Self {
        Self {
            table_id,
            partition,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.table_id, self.partition)
    }
}

/// Token identifying one lease instance of a primary replica.
///
/// A transaction records the token under which it enlisted a partition; at
/// commit time the token must still match the current primary's lease,
/// otherwise the enlistment is stale.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LeaseToken(pub u64);

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
