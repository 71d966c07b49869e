//! In-memory placement driver and replica service for tests.

use crate::error::{PlacementError, ReplicaError};
use crate::messages::{ReplicaRequest, ReplicaResponse};
use crate::placement::{PlacementDriver, ReplicaMeta};
use crate::service::ReplicaService;
use async_trait::async_trait;
use lattice_common::PartitionId;
use lattice_hlc::HlcTimestamp;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;

/// Placement driver backed by an explicit lease table.
///
/// `await_primary_replica` resolves as soon as a lease is installed for the
/// group, so tests can exercise the bounded-await path by installing leases
/// late or not at all.
#[derive(Default)]
pub struct MockPlacementDriver {
    leases: Mutex<HashMap<PartitionId, ReplicaMeta>>,
    changed: Notify,
}

impl MockPlacementDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_primary(&self, group: PartitionId, meta: ReplicaMeta) {
        self.leases.lock().insert(group, meta);
        self.changed.notify_waiters();
    }

    pub fn clear_primary(&self, group: PartitionId) {
        self.leases.lock().remove(&group);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl PlacementDriver for MockPlacementDriver {
    async fn await_primary_replica(
        &self,
        group: PartitionId,
        at: HlcTimestamp,
        timeout: Duration,
    ) -> Result<ReplicaMeta, PlacementError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register for notification before checking, otherwise an
            // installation between the check and the wait is lost.
            let notified = self.changed.notified();

            if let Some(meta) = self.leases.lock().get(&group).cloned() {
                return Ok(meta);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(PlacementError::AwaitTimeout { group, at });
            }

            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(PlacementError::AwaitTimeout { group, at });
            }
        }
    }

    async fn primary_replica(&self, group: PartitionId, _at: HlcTimestamp) -> Option<ReplicaMeta> {
        self.leases.lock().get(&group).cloned()
    }
}

/// Replica service recording every request and answering from a script.
///
/// Each invocation consumes the next scripted failure if one is queued,
/// otherwise it acknowledges.
#[derive(Default)]
pub struct MockReplicaService {
    requests: Mutex<Vec<(String, ReplicaRequest)>>,
    scripted_failures: Mutex<VecDeque<ReplicaError>>,
}

impl MockReplicaService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the next invocation.
    pub fn fail_next(&self, error: ReplicaError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// Every request sent so far, in order, with its target node.
    pub fn sent(&self) -> Vec<(String, ReplicaRequest)> {
        self.requests.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ReplicaService for MockReplicaService {
    async fn invoke(
        &self,
        node: &str,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, ReplicaError> {
        let tx_id = request.tx_id();

        self.requests.lock().push((node.to_string(), request));

        if let Some(error) = self.scripted_failures.lock().pop_front() {
            return Err(error);
        }

        Ok(ReplicaResponse { tx_id })
    }
}
