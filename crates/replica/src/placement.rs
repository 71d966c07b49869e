//! Primary replica resolution.

use crate::error::PlacementError;
use async_trait::async_trait;
use lattice_common::{LeaseToken, PartitionId};
use lattice_hlc::HlcTimestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The primary replica of a replication group for one lease interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMeta {
    /// Node currently holding the lease.
    pub leaseholder: String,
    pub lease_start: HlcTimestamp,
    pub lease_expiration: HlcTimestamp,
}

impl ReplicaMeta {
    pub fn new(
        leaseholder: impl Into<String>,
        lease_start: HlcTimestamp,
        lease_expiration: HlcTimestamp,
    ) -> Self {
        Self {
            leaseholder: leaseholder.into(),
            lease_start,
            lease_expiration,
        }
    }

    /// Token identifying this lease instance. Two metas with the same
    /// leaseholder but different lease intervals carry different tokens.
    pub fn lease_token(&self) -> LeaseToken {
        LeaseToken(self.lease_start.as_nanos())
    }
}

/// Resolves the primary replica of a replication group at a timestamp.
///
/// The leasing algorithm behind this is external; the manager only consumes
/// the resolved lease.
#[async_trait]
pub trait PlacementDriver: Send + Sync {
    /// Wait until a primary replica is known for `group` as of `at`,
    /// bounded by `timeout`.
    async fn await_primary_replica(
        &self,
        group: PartitionId,
        at: HlcTimestamp,
        timeout: Duration,
    ) -> Result<ReplicaMeta, PlacementError>;

    /// Currently known primary replica for `group` as of `at`, if any.
    async fn primary_replica(&self, group: PartitionId, at: HlcTimestamp) -> Option<ReplicaMeta>;
}
