//! The transaction manager.
//!
//! Opens read-write and read-only transactions, tracks their state, and
//! drives the two-phase finish protocol against replicated partition groups
//! under the leaseholder model. Uses 2PC for atomic commitment; concurrency
//! control is the enlisted partitions' concern.

use crate::config::TxManagerConfig;
use crate::context::TxContext;
use crate::error::{Result, TxnError};
use crate::gate::ShutdownGate;
use crate::transaction::{ReadOnlyTransaction, ReadWriteTransaction, Transaction};
use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use futures::future::{join_all, try_join_all};
use lattice_common::{
    Completion, FinishWatch, LeaseToken, PartitionId, TimestampTracker, TransactionId,
    TransactionIdGenerator, TxState, TxStateMeta,
};
use lattice_hlc::{HlcClock, HlcTimestamp, MAX_CLOCK_SKEW};
use lattice_replica::{PlacementDriver, ReplicaError, ReplicaRequest, ReplicaService,
    TxCleanupRequest, TxFinishRequest};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Key of the read-only registry: read timestamp first, then id, so one
/// range scan yields every read-only transaction at or below a watermark.
type ReadOnlyKey = (HlcTimestamp, TransactionId);

/// Transaction manager for one coordinator node.
///
/// All cross-transaction state lives in independently keyed concurrent
/// maps; the only lock spanning transactions is the low-watermark
/// read-write lock, which read-only begins take shared and watermark
/// advances take exclusively.
pub struct TxManager {
    local_node: String,
    clock: Arc<HlcClock>,
    id_generator: TransactionIdGenerator,
    placement: Arc<dyn PlacementDriver>,
    replicas: Arc<dyn ReplicaService>,
    config: TxManagerConfig,

    /// State metadata per transaction id, updated only through
    /// compare-and-transition in [`TxManager::update_tx_meta`].
    states: DashMap<TransactionId, TxStateMeta>,

    /// Transient finish/inflight contexts per transaction id.
    contexts: DashMap<TransactionId, TxContext>,

    /// Completion of every active read-only transaction, ordered by
    /// (read timestamp, id).
    read_only: SkipMap<ReadOnlyKey, Completion<()>>,

    /// No read-only transaction may begin at or below this timestamp.
    /// `None` until the first update.
    low_watermark: RwLock<Option<HlcTimestamp>>,

    stop_guard: AtomicBool,
    gate: ShutdownGate,
}

impl TxManager {
    pub fn new(
        local_node: impl Into<String>,
        clock: Arc<HlcClock>,
        placement: Arc<dyn PlacementDriver>,
        replicas: Arc<dyn ReplicaService>,
        config: TxManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_node: local_node.into(),
            clock,
            id_generator: TransactionIdGenerator::new(),
            placement,
            replicas,
            config,
            states: DashMap::new(),
            contexts: DashMap::new(),
            read_only: SkipMap::new(),
            low_watermark: RwLock::new(None),
            stop_guard: AtomicBool::new(false),
            gate: ShutdownGate::new(),
        })
    }

    pub(crate) fn coordinator_id(&self) -> &str {
        &self.local_node
    }

    pub(crate) fn clock(&self) -> &HlcClock {
        &self.clock
    }

    /// Begin a transaction.
    ///
    /// The transaction is recorded as pending before the handle is
    /// returned, for both read-write and read-only transactions. A
    /// read-only begin fails with [`TxnError::ReadTimestampTooOld`] when
    /// its read timestamp would not exceed the low watermark; the check
    /// runs before registration so a failed begin leaves no pending
    /// registry entry behind.
    pub fn begin(
        self: &Arc<Self>,
        tracker: Arc<TimestampTracker>,
        read_only: bool,
    ) -> Result<Transaction> {
        let begin_timestamp = self.clock.now();
        let tx_id = self.id_generator.generate(begin_timestamp);

        self.update_tx_meta(tx_id, |_| TxStateMeta::pending(self.local_node.clone()));

        if !read_only {
            return Ok(Transaction::ReadWrite(ReadWriteTransaction::new(
                self.clone(),
                tracker,
                tx_id,
            )));
        }

        let read_timestamp = match tracker.get() {
            Some(observed) => observed.max(self.current_read_timestamp()),
            None => self.current_read_timestamp(),
        };

        // Shared lock: concurrent read-only begins proceed together, a
        // concurrent watermark advance is excluded.
        let watermark_guard = self.low_watermark.read();

        if let Some(low_watermark) = *watermark_guard {
            if read_timestamp <= low_watermark {
                return Err(TxnError::ReadTimestampTooOld {
                    read_timestamp,
                    low_watermark,
                });
            }
        }

        debug_assert!(
            self.read_only.get(&(read_timestamp, tx_id)).is_none(),
            "read-only transaction {tx_id} is already registered"
        );

        self.read_only
            .insert((read_timestamp, tx_id), Completion::new());

        drop(watermark_guard);

        Ok(Transaction::ReadOnly(ReadOnlyTransaction::new(
            self.clone(),
            tracker,
            tx_id,
            read_timestamp,
        )))
    }

    /// Timestamp at which every replica is guaranteed to have observed safe
    /// time, used as the default read timestamp of read-only transactions.
    fn current_read_timestamp(&self) -> HlcTimestamp {
        self.clock
            .now()
            .shift_back(self.config.idle_safe_time_propagation + MAX_CLOCK_SKEW)
    }

    /// Current state metadata of a transaction, if known.
    pub fn state_meta(&self, tx_id: TransactionId) -> Option<TxStateMeta> {
        self.states.get(&tx_id).map(|entry| entry.value().clone())
    }

    /// Apply `updater` to the transaction's state metadata under the
    /// per-key entry lock. An update proposing an illegal state transition
    /// is discarded and the old metadata is retained. Returns the metadata
    /// now in the table.
    pub fn update_tx_meta<F>(&self, tx_id: TransactionId, updater: F) -> TxStateMeta
    where
        F: FnOnce(Option<&TxStateMeta>) -> TxStateMeta,
    {
        use dashmap::mapref::entry::Entry;

        match self.states.entry(tx_id) {
            Entry::Occupied(mut entry) => {
                let proposed = updater(Some(entry.get()));

                if TxState::transition_allowed(Some(entry.get().state), proposed.state) {
                    *entry.get_mut() = proposed;
                }

                entry.get().clone()
            }
            Entry::Vacant(entry) => entry.insert(updater(None)).clone(),
        }
    }

    /// Locally finish a transaction that touched nothing durable.
    pub fn finish_full(&self, tracker: &TimestampTracker, tx_id: TransactionId, commit: bool) {
        let commit_timestamp = if commit {
            let now = self.clock.now();
            tracker.update(now);
            Some(now)
        } else {
            None
        };

        let local_node = self.local_node.clone();

        self.update_tx_meta(tx_id, |old| {
            let coordinator = old
                .map(|meta| meta.coordinator.clone())
                .unwrap_or(local_node);

            TxStateMeta::finished(commit, coordinator, commit_timestamp)
        });
    }

    /// Finish a transaction across its enlisted replication groups.
    ///
    /// Among concurrent finishers for one transaction exactly one drives
    /// the protocol; the rest await the same outcome. The commit path first
    /// waits for inflight writes to drain, verifies the enlisted leases,
    /// and then durably records the decision on the commit partition.
    pub async fn finish(
        &self,
        tracker: &TimestampTracker,
        commit_partition: Option<PartitionId>,
        commit: bool,
        enlisted: HashMap<PartitionId, LeaseToken>,
        tx_id: TransactionId,
    ) -> Result<()> {
        if enlisted.is_empty() {
            // No replicas to contact: the local record is the whole truth.
            let commit_timestamp = if commit { Some(self.clock.now()) } else { None };
            let local_node = self.local_node.clone();

            self.update_tx_meta(tx_id, |_| {
                TxStateMeta::finished(commit, local_node, commit_timestamp)
            });

            return Ok(());
        }

        let commit_partition = match commit_partition {
            Some(partition) => partition,
            None => panic!("commit partition must be assigned before finishing {tx_id}"),
        };

        // Publish the finishing state so that concurrent readers of this
        // transaction's state await the outcome instead of acting on a
        // stale pending state. Reuse an already-published watch so every
        // observer resolves against the same future.
        let mut watch: Option<FinishWatch> = None;
        let local_node = self.local_node.clone();

        self.update_tx_meta(tx_id, |old| match old {
            Some(meta) if meta.state == TxState::Finishing => {
                watch = meta.finishing.clone();
                meta.clone()
            }
            _ => {
                let fresh = FinishWatch::new();
                watch = Some(fresh.clone());
                TxStateMeta::finishing(local_node, fresh)
            }
        });

        let finish_watch = match watch {
            Some(watch) => watch,
            None => FinishWatch::new(),
        };

        // Elect the performing finisher: compare-and-set the context from
        // "not finishing" to "finishing" under the entry lock.
        let (performing, progress, drain, no_inflights) = {
            let mut ctx = self.contexts.entry(tx_id).or_default();

            let (performing, progress) = match ctx.finish.clone() {
                Some(progress) => (false, progress),
                None => {
                    let progress = Completion::new();
                    ctx.finish = Some(progress.clone());
                    (true, progress)
                }
            };

            (performing, progress, ctx.drain.clone(), ctx.inflights == 0)
        };

        if !performing {
            return progress.wait().await;
        }

        if commit {
            // A rollback needs no drain: inflight writes are rejected as
            // stale once the outcome is known.
            if no_inflights {
                drain.complete(());
            }

            drain.wait().await;
        }

        let result = self
            .prepare_finish(tracker, commit_partition, commit, &enlisted, tx_id, &finish_watch)
            .await;

        progress.complete(result.clone());

        result
    }

    async fn prepare_finish(
        &self,
        tracker: &TimestampTracker,
        commit_partition: PartitionId,
        commit: bool,
        enlisted: &HashMap<PartitionId, LeaseToken>,
        tx_id: TransactionId,
        finish_watch: &FinishWatch,
    ) -> Result<()> {
        let commit_timestamp = if commit { Some(self.clock.now()) } else { None };

        let verification = match commit_timestamp {
            Some(commit_timestamp) => {
                self.verify_commit_timestamp(enlisted, commit_timestamp).await
            }
            None => Ok(()),
        };

        // A failed verification downgrades the durable outcome to a
        // rollback, but the caller still receives the verification error so
        // it learns the commit did not happen as requested.
        let verified_commit = commit && verification.is_ok();

        let groups: Vec<PartitionId> = enlisted.keys().copied().collect();

        self.durable_finish(
            tracker,
            commit_partition,
            verified_commit,
            &groups,
            tx_id,
            commit_timestamp,
            finish_watch,
        )
        .await?;

        verification
    }

    /// Check that every enlisted group's primary replica is still the one
    /// the transaction enlisted and that its lease covers the commit
    /// timestamp.
    async fn verify_commit_timestamp(
        &self,
        enlisted: &HashMap<PartitionId, LeaseToken>,
        commit_timestamp: HlcTimestamp,
    ) -> Result<()> {
        let checks = enlisted.iter().map(|(&group, &token)| async move {
            match self.placement.primary_replica(group, commit_timestamp).await {
                Some(current)
                    if current.lease_token() == token
                        && commit_timestamp <= current.lease_expiration =>
                {
                    Ok(())
                }
                _ => Err(TxnError::PrimaryReplicaExpired {
                    group,
                    token,
                    commit_timestamp,
                }),
            }
        });

        try_join_all(checks).await.map(|_| ())
    }

    /// Drive the finish request to the commit partition until it either
    /// lands durably or fails terminally. Each attempt is one loop step;
    /// recoverable failures retry with backoff.
    #[allow(clippy::too_many_arguments)]
    async fn durable_finish(
        &self,
        tracker: &TimestampTracker,
        commit_partition: PartitionId,
        commit: bool,
        groups: &[PartitionId],
        tx_id: TransactionId,
        commit_timestamp: Option<HlcTimestamp>,
        finish_watch: &FinishWatch,
    ) -> Result<()> {
        let mut backoff = self.config.retry_backoff_base;

        loop {
            let attempt = {
                let _gate = self.gate.enter().ok_or(TxnError::Stopping)?;

                self.send_finish_request(
                    tracker,
                    commit_partition,
                    commit,
                    groups,
                    tx_id,
                    commit_timestamp,
                    finish_watch,
                )
                .await
            };

            match attempt {
                Ok(()) => return Ok(()),
                Err(TxnError::Replica(ReplicaError::TransactionAlreadyAborted { .. })) => {
                    // A competing recovery path already aborted the
                    // transaction; adopt its decision as local truth.
                    let local_node = self.local_node.clone();
                    let adopted = self.update_tx_meta(tx_id, |old| {
                        let coordinator = old
                            .map(|meta| meta.coordinator.clone())
                            .unwrap_or(local_node);

                        TxStateMeta::finished(false, coordinator, None)
                    });

                    finish_watch.complete(adopted);

                    return Err(TxnError::Aborted { tx_id });
                }
                Err(error) if error.finish_retryable() => {
                    tracing::warn!(
                        tx_id = %tx_id,
                        error = %error,
                        "failed to finish transaction, retrying"
                    );

                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.retry_backoff_cap);
                }
                Err(error) => {
                    tracing::warn!(tx_id = %tx_id, error = %error, "failed to finish transaction");

                    return Err(error);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_finish_request(
        &self,
        tracker: &TimestampTracker,
        commit_partition: PartitionId,
        commit: bool,
        groups: &[PartitionId],
        tx_id: TransactionId,
        commit_timestamp: Option<HlcTimestamp>,
        finish_watch: &FinishWatch,
    ) -> Result<()> {
        let meta = self
            .placement
            .await_primary_replica(
                commit_partition,
                self.clock.now(),
                self.config.await_primary_replica_timeout,
            )
            .await
            .map_err(|error| {
                tracing::error!(
                    group = %commit_partition,
                    error = %error,
                    "failed to resolve the primary replica of the commit partition"
                );

                TxnError::ReplicaUnavailable {
                    group: commit_partition,
                }
            })?;

        tracing::debug!(
            tx_id = %tx_id,
            partition = %commit_partition,
            node = %meta.leaseholder,
            term = %meta.lease_token(),
            commit,
            "sending finish request"
        );

        let request = ReplicaRequest::Finish(TxFinishRequest {
            tx_id,
            commit_partition,
            commit,
            commit_timestamp: if commit { commit_timestamp } else { None },
            groups: groups.to_vec(),
            term: meta.lease_token(),
            timestamp: self.clock.now(),
        });

        self.replicas.invoke(&meta.leaseholder, request).await?;

        // The decision is durable; move the local record to its terminal
        // state and release everyone awaiting the finishing watch.
        let local_node = self.local_node.clone();
        let stored_timestamp = if commit { commit_timestamp } else { None };

        let published = self.update_tx_meta(tx_id, |old| match old {
            Some(meta) if meta.state.is_final() => meta.clone(),
            old => {
                let coordinator = old
                    .map(|meta| meta.coordinator.clone())
                    .unwrap_or(local_node);

                TxStateMeta::finished(commit, coordinator, stored_timestamp)
            }
        });

        finish_watch.complete(published);

        if commit {
            if let Some(commit_timestamp) = commit_timestamp {
                tracker.update(commit_timestamp);
            }
        }

        Ok(())
    }

    /// Ask one partition's primary to release locks and intents left by a
    /// finished transaction.
    pub async fn cleanup(
        &self,
        node: &str,
        partition: PartitionId,
        tx_id: TransactionId,
        commit: bool,
        commit_timestamp: Option<HlcTimestamp>,
    ) -> Result<()> {
        let request = ReplicaRequest::Cleanup(TxCleanupRequest {
            group: partition,
            tx_id,
            commit,
            commit_timestamp,
            timestamp: self.clock.now(),
        });

        self.replicas.invoke(node, request).await?;

        Ok(())
    }

    /// Run cleanup work on a background task, decoupled from the finishing
    /// task so finish latency does not include cleanup.
    pub fn execute_cleanup_async<F>(&self, work: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(work)
    }

    /// Register a replicated write as in flight.
    ///
    /// Returns `false` when the transaction's finish has already begun, in
    /// which case the write must not proceed.
    pub fn add_inflight(&self, tx_id: TransactionId) -> bool {
        let mut ctx = self.contexts.entry(tx_id).or_default();

        if ctx.is_finishing() {
            return false;
        }

        ctx.inflights += 1;
        true
    }

    /// Acknowledge a previously registered inflight write.
    ///
    /// Calling this without a matching [`TxManager::add_inflight`] is a
    /// programming error and panics.
    pub fn remove_inflight(&self, tx_id: TransactionId) {
        let drained = {
            let mut ctx = match self.contexts.get_mut(&tx_id) {
                Some(ctx) => ctx,
                None => panic!("no inflight context for transaction {tx_id}"),
            };

            assert!(ctx.inflights > 0, "inflight underflow for transaction {tx_id}");
            ctx.inflights -= 1;

            if ctx.inflights == 0 && ctx.is_finishing() {
                Some(ctx.drain.clone())
            } else {
                None
            }
        };

        // Complete outside the entry guard so waiters never wake under the
        // shard lock.
        if let Some(drain) = drained {
            drain.complete(());
        }
    }

    /// Advance the low watermark.
    ///
    /// The new mark must be strictly greater than the previous one;
    /// violating that is a programming error and panics. Returns a future
    /// resolving once every read-only transaction with a read timestamp at
    /// or below the new mark has completed.
    pub fn update_low_watermark(
        &self,
        new_low_watermark: HlcTimestamp,
    ) -> impl Future<Output = ()> + Send + 'static {
        let pending: Vec<Completion<()>> = {
            let mut watermark = self.low_watermark.write();

            if let Some(previous) = *watermark {
                assert!(
                    new_low_watermark > previous,
                    "low watermark must strictly increase: previous={previous}, new={new_low_watermark}"
                );
            }

            *watermark = Some(new_low_watermark);

            self.read_only
                .range(..=(new_low_watermark, TransactionId::MAX))
                .map(|entry| entry.value().clone())
                .collect()
        };

        async move {
            join_all(pending.iter().map(|done| done.wait())).await;
        }
    }

    /// Remove a read-only transaction from the registry and complete its
    /// registration, releasing any watermark advance waiting on it.
    pub(crate) fn complete_read_only(&self, read_timestamp: HlcTimestamp, tx_id: TransactionId) {
        let entry = match self.read_only.remove(&(read_timestamp, tx_id)) {
            Some(entry) => entry,
            None => panic!("read-only transaction {tx_id} is not registered"),
        };

        entry.value().complete(());
    }

    /// Number of transactions currently pending.
    pub fn pending(&self) -> usize {
        self.states
            .iter()
            .filter(|entry| entry.value().state == TxState::Pending)
            .count()
    }

    /// Number of transactions in a terminal state.
    pub fn finished(&self) -> usize {
        self.states
            .iter()
            .filter(|entry| entry.value().state.is_final())
            .count()
    }

    /// Stop the manager: refuse new finish attempts and wait for the ones
    /// already running. Idempotent.
    pub async fn stop(&self) {
        if self.stop_guard.swap(true, Ordering::SeqCst) {
            return;
        }

        self.gate.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_hlc::NodeId;
    use lattice_replica::mock::{MockPlacementDriver, MockReplicaService};

    fn manager() -> Arc<TxManager> {
        TxManager::new(
            "n0",
            Arc::new(HlcClock::new(NodeId::new(0))),
            Arc::new(MockPlacementDriver::new()),
            Arc::new(MockReplicaService::new()),
            TxManagerConfig::default(),
        )
    }

    fn tx_id(manager: &TxManager) -> TransactionId {
        manager.id_generator.generate(manager.clock.now())
    }

    #[tokio::test]
    async fn illegal_transition_is_a_silent_no_op() {
        let manager = manager();
        let tx_id = tx_id(&manager);

        manager.update_tx_meta(tx_id, |_| TxStateMeta::pending("n0".into()));
        manager.update_tx_meta(tx_id, |_| TxStateMeta::finished(true, "n0".into(), None));

        let after = manager.update_tx_meta(tx_id, |_| TxStateMeta::pending("n0".into()));

        assert_eq!(after.state, TxState::Committed);
        assert_eq!(
            manager.state_meta(tx_id).map(|meta| meta.state),
            Some(TxState::Committed)
        );
    }

    #[tokio::test]
    async fn terminal_state_never_flips() {
        let manager = manager();
        let tx_id = tx_id(&manager);

        manager.update_tx_meta(tx_id, |_| TxStateMeta::finished(false, "n0".into(), None));
        manager.update_tx_meta(tx_id, |_| TxStateMeta::finished(true, "n0".into(), None));

        assert_eq!(
            manager.state_meta(tx_id).map(|meta| meta.state),
            Some(TxState::Aborted)
        );
    }

    #[tokio::test]
    async fn inflights_are_refused_once_finishing() {
        let manager = manager();
        let tx_id = tx_id(&manager);

        assert!(manager.add_inflight(tx_id));
        assert!(manager.add_inflight(tx_id));

        manager
            .contexts
            .entry(tx_id)
            .or_default()
            .finish = Some(Completion::new());

        assert!(!manager.add_inflight(tx_id));

        manager.remove_inflight(tx_id);
        manager.remove_inflight(tx_id);
    }

    #[tokio::test]
    #[should_panic(expected = "no inflight context")]
    async fn remove_inflight_without_context_panics() {
        let manager = manager();

        manager.remove_inflight(tx_id(&manager));
    }

    #[tokio::test]
    async fn cleanup_runs_detached_from_the_caller() {
        let manager = manager();
        let tx_id = tx_id(&manager);

        let cleaned = {
            let manager = manager.clone();
            manager.clone().execute_cleanup_async(async move {
                manager
                    .cleanup("n1", PartitionId::new(1, 0), tx_id, false, None)
                    .await
                    .unwrap();
            })
        };

        cleaned.await.unwrap();
    }

    #[tokio::test]
    async fn finish_full_commits_locally_and_advances_the_tracker() {
        let manager = manager();
        let tracker = TimestampTracker::new();
        let tx_id = tx_id(&manager);

        manager.update_tx_meta(tx_id, |_| TxStateMeta::pending("n0".into()));
        manager.finish_full(&tracker, tx_id, true);

        let meta = manager.state_meta(tx_id).unwrap();
        assert_eq!(meta.state, TxState::Committed);
        assert!(meta.commit_timestamp.is_some());
        assert_eq!(meta.commit_timestamp, tracker.get());
        assert_eq!(manager.finished(), 1);
        assert_eq!(manager.pending(), 0);
    }
}
