//! Transaction handles returned by [`TxManager::begin`].

use crate::context::FinishOutcome;
use crate::error::{Result, TxnError};
use crate::manager::TxManager;
use dashmap::DashMap;
use lattice_common::{Completion, LeaseToken, PartitionId, TimestampTracker, TransactionId, TxState};
use lattice_hlc::HlcTimestamp;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// A transaction opened by the manager.
pub enum Transaction {
    ReadWrite(ReadWriteTransaction),
    ReadOnly(ReadOnlyTransaction),
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        match self {
            Transaction::ReadWrite(tx) => tx.id(),
            Transaction::ReadOnly(tx) => tx.id(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Transaction::ReadOnly(_))
    }

    /// Read timestamp, for read-only transactions only.
    pub fn read_timestamp(&self) -> Option<HlcTimestamp> {
        match self {
            Transaction::ReadWrite(_) => None,
            Transaction::ReadOnly(tx) => Some(tx.read_timestamp()),
        }
    }

    pub fn as_read_write(&self) -> Option<&ReadWriteTransaction> {
        match self {
            Transaction::ReadWrite(tx) => Some(tx),
            Transaction::ReadOnly(_) => None,
        }
    }

    pub async fn commit(&self) -> Result<()> {
        match self {
            Transaction::ReadWrite(tx) => tx.finish(true).await,
            Transaction::ReadOnly(tx) => tx.finish(true).await,
        }
    }

    pub async fn rollback(&self) -> Result<()> {
        match self {
            Transaction::ReadWrite(tx) => tx.finish(false).await,
            Transaction::ReadOnly(tx) => tx.finish(false).await,
        }
    }
}

/// Handle of a read-write transaction.
///
/// Partitions are enlisted as statement execution touches them, possibly
/// from many tasks at once. The coordination lock admits any number of
/// concurrent enlists (shared side) while finishing runs exclusively.
pub struct ReadWriteTransaction {
    manager: Arc<TxManager>,
    tracker: Arc<TimestampTracker>,
    id: TransactionId,

    /// Enlisted partitions: partition id to (primary replica node, lease
    /// token). First writer wins per partition.
    enlisted: DashMap<PartitionId, (String, LeaseToken)>,

    /// The partition anchoring the durable commit decision. Set once.
    commit_partition: OnceLock<PartitionId>,

    /// Shared for enlist, exclusive for starting the finish.
    coordination: RwLock<()>,

    /// Outcome shared by every finish call on this handle. Installed by the
    /// first finisher under the exclusive side of `coordination`.
    finish: Mutex<Option<Completion<FinishOutcome>>>,
}

impl ReadWriteTransaction {
    pub(crate) fn new(
        manager: Arc<TxManager>,
        tracker: Arc<TimestampTracker>,
        id: TransactionId,
    ) -> Self {
        Self {
            manager,
            tracker,
            id,
            enlisted: DashMap::new(),
            commit_partition: OnceLock::new(),
            coordination: RwLock::new(()),
            finish: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn begin_timestamp(&self) -> HlcTimestamp {
        self.id.begin_timestamp()
    }

    pub fn state(&self) -> Option<TxState> {
        self.manager.state_meta(self.id).map(|meta| meta.state)
    }

    /// Assign the commit partition. Returns whether this call won; a loser
    /// must use the winner's value.
    pub fn assign_commit_partition(&self, partition: PartitionId) -> bool {
        self.commit_partition.set(partition).is_ok()
    }

    pub fn commit_partition(&self) -> Option<PartitionId> {
        self.commit_partition.get().copied()
    }

    /// The (node, lease token) pair recorded for a partition, if enlisted.
    pub fn enlisted_replica(&self, partition: PartitionId) -> Option<(String, LeaseToken)> {
        self.enlisted.get(&partition).map(|entry| entry.value().clone())
    }

    /// Record that this transaction touched `partition` through the given
    /// primary replica.
    ///
    /// Idempotent per partition: the first recorded (node, token) pair wins
    /// and is returned to every caller. Fails once the transaction is
    /// finishing or finished.
    pub fn enlist(
        &self,
        partition: PartitionId,
        replica: (String, LeaseToken),
    ) -> Result<(String, LeaseToken)> {
        self.check_enlist_ready()?;

        let _shared = self.coordination.read();

        // The state may have moved to finishing between the unlocked check
        // and acquiring the shared lock.
        self.check_enlist_ready()?;

        Ok(self
            .enlisted
            .entry(partition)
            .or_insert(replica)
            .value()
            .clone())
    }

    fn check_enlist_ready(&self) -> Result<()> {
        if let Some(meta) = self.manager.state_meta(self.id) {
            if meta.state != TxState::Pending {
                return Err(TxnError::AlreadyFinished {
                    tx_id: self.id,
                    state: meta.state,
                });
            }
        }

        // The finish slot is installed under the exclusive side of
        // `coordination` before the enlistment snapshot is taken, so an
        // enlist that sees it empty under the shared side is guaranteed to
        // be part of the snapshot. The manager-side state may still read
        // pending here while the finishing task has not run yet.
        if self.finish.lock().is_some() {
            return Err(TxnError::AlreadyFinished {
                tx_id: self.id,
                state: TxState::Finishing,
            });
        }

        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        self.finish(true).await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.finish(false).await
    }

    /// Finish the transaction.
    ///
    /// Idempotent: the first call starts the manager-level finish exactly
    /// once and every call, concurrent or later, observes that single
    /// outcome regardless of its own `commit` flag.
    pub async fn finish(&self, commit: bool) -> Result<()> {
        if let Some(meta) = self.manager.state_meta(self.id) {
            if meta.state.is_final() {
                let existing = self.finish.lock().clone();

                if let Some(progress) = existing {
                    return progress.wait().await;
                }

                // Finished externally, e.g. by a recovery path.
                return if meta.state == TxState::Aborted && commit {
                    Err(TxnError::Aborted { tx_id: self.id })
                } else {
                    Ok(())
                };
            }
        }

        let progress = {
            let _exclusive = self.coordination.write();
            let mut slot = self.finish.lock();

            match slot.clone() {
                Some(progress) => progress,
                None => {
                    let progress: Completion<FinishOutcome> = Completion::new();
                    *slot = Some(progress.clone());

                    let manager = self.manager.clone();
                    let tracker = self.tracker.clone();
                    let tx_id = self.id;
                    let commit_partition = self.commit_partition();
                    let enlisted: HashMap<PartitionId, LeaseToken> = self
                        .enlisted
                        .iter()
                        .map(|entry| (*entry.key(), entry.value().1))
                        .collect();

                    let driver = progress.clone();

                    tokio::spawn(async move {
                        let outcome = manager
                            .finish(&tracker, commit_partition, commit, enlisted, tx_id)
                            .await;

                        driver.complete(outcome);
                    });

                    progress
                }
            }
        };

        progress.wait().await
    }
}

/// Handle of a read-only transaction.
///
/// The read timestamp is fixed at creation; the handle never enlists
/// partitions and has no commit partition. Finishing releases the
/// registration that holds back low-watermark advances past its read
/// timestamp.
pub struct ReadOnlyTransaction {
    manager: Arc<TxManager>,
    tracker: Arc<TimestampTracker>,
    id: TransactionId,
    read_timestamp: HlcTimestamp,
    finished: AtomicBool,
}

impl ReadOnlyTransaction {
    pub(crate) fn new(
        manager: Arc<TxManager>,
        tracker: Arc<TimestampTracker>,
        id: TransactionId,
        read_timestamp: HlcTimestamp,
    ) -> Self {
        Self {
            manager,
            tracker,
            id,
            read_timestamp,
            finished: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn read_timestamp(&self) -> HlcTimestamp {
        self.read_timestamp
    }

    pub async fn commit(&self) -> Result<()> {
        self.finish(true).await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.finish(false).await
    }

    pub async fn finish(&self, commit: bool) -> Result<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if commit {
            self.tracker.update(self.read_timestamp);
        }

        let coordinator = self.manager.coordinator_id().to_string();

        self.manager.update_tx_meta(self.id, |old| {
            let coordinator = old
                .map(|meta| meta.coordinator.clone())
                .unwrap_or(coordinator);

            lattice_common::TxStateMeta::finished(commit, coordinator, None)
        });

        self.manager.complete_read_only(self.read_timestamp, self.id);

        Ok(())
    }
}
