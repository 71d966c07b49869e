//! Read-only transactions against the low watermark: registration,
//! rejection below the mark, and the drain barrier on watermark advances.

use lattice_common::{TimestampTracker, TxState};
use lattice_hlc::{HlcClock, HlcTimestamp, NodeId};
use lattice_replica::mock::{MockPlacementDriver, MockReplicaService};
use lattice_txn::{Transaction, TxManager, TxManagerConfig, TxnError};
use std::sync::Arc;
use std::time::Duration;

struct Cluster {
    manager: Arc<TxManager>,
    tracker: Arc<TimestampTracker>,
}

fn cluster() -> Cluster {
    let manager = TxManager::new(
        "n0",
        Arc::new(HlcClock::new(NodeId::new(0))),
        Arc::new(MockPlacementDriver::new()),
        Arc::new(MockReplicaService::new()),
        TxManagerConfig::default(),
    );

    Cluster {
        manager,
        tracker: Arc::new(TimestampTracker::new()),
    }
}

fn mark(physical: u64) -> HlcTimestamp {
    HlcTimestamp::new(physical, 0, NodeId::new(0))
}

fn begin_read_only(cluster: &Cluster) -> Transaction {
    match cluster.manager.begin(cluster.tracker.clone(), true) {
        Ok(tx) => tx,
        Err(err) => panic!("begin failed: {err}"),
    }
}

#[tokio::test]
async fn read_only_begin_assigns_a_read_timestamp() {
    let cluster = cluster();

    let tx = begin_read_only(&cluster);

    assert!(tx.is_read_only());
    let read_timestamp = tx.read_timestamp().unwrap();
    assert!(read_timestamp > HlcTimestamp::MIN);

    tx.commit().await.unwrap();
}

#[tokio::test]
async fn read_only_begin_below_the_watermark_fails_and_leaks_nothing() {
    let cluster = cluster();

    // A watermark far past any wall-clock-derived read timestamp.
    let high = mark(u64::MAX / 2);
    drop(cluster.manager.update_low_watermark(high));

    let err = match cluster.manager.begin(cluster.tracker.clone(), true) {
        Err(err) => err,
        Ok(_) => panic!("begin should have been refused"),
    };

    assert!(matches!(
        err,
        TxnError::ReadTimestampTooOld { low_watermark, read_timestamp }
            if low_watermark == high && read_timestamp <= high
    ));

    // The failed begin left no registration behind: the next advance has
    // nothing to wait for.
    tokio::time::timeout(
        Duration::from_secs(1),
        cluster.manager.update_low_watermark(mark(u64::MAX / 2 + 1)),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn watermark_advance_waits_for_covered_read_only_transactions() {
    let cluster = cluster();

    let tx = begin_read_only(&cluster);
    let read_timestamp = tx.read_timestamp().unwrap();

    let advance = tokio::spawn(
        cluster
            .manager
            .update_low_watermark(mark(read_timestamp.physical + 1_000_000)),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!advance.is_finished());

    tx.commit().await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), advance)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn watermark_advance_ignores_newer_read_only_transactions() {
    let cluster = cluster();

    let tx = begin_read_only(&cluster);
    let read_timestamp = tx.read_timestamp().unwrap();

    // A mark strictly below the active read timestamp does not wait on it.
    tokio::time::timeout(
        Duration::from_secs(1),
        cluster
            .manager
            .update_low_watermark(mark(read_timestamp.physical - 1)),
    )
    .await
    .unwrap();

    tx.commit().await.unwrap();
}

#[tokio::test]
#[should_panic(expected = "strictly increase")]
async fn low_watermark_must_strictly_increase() {
    let cluster = cluster();

    drop(cluster.manager.update_low_watermark(mark(5)));
    drop(cluster.manager.update_low_watermark(mark(5)));
}

#[tokio::test]
async fn observed_timestamp_raises_the_read_timestamp() {
    let cluster = cluster();

    let observed = mark(u64::MAX / 4);
    cluster.tracker.update(observed);

    let tx = begin_read_only(&cluster);

    assert_eq!(tx.read_timestamp(), Some(observed));

    tx.commit().await.unwrap();
}

#[tokio::test]
async fn read_only_commit_advances_the_tracker() {
    let cluster = cluster();

    let tx = begin_read_only(&cluster);
    let read_timestamp = tx.read_timestamp().unwrap();

    assert_eq!(cluster.tracker.get(), None);

    tx.commit().await.unwrap();

    assert_eq!(cluster.tracker.get(), Some(read_timestamp));

    let meta = cluster.manager.state_meta(tx.id()).unwrap();
    assert_eq!(meta.state, TxState::Committed);
    assert_eq!(meta.commit_timestamp, None);
}

#[tokio::test]
async fn read_only_rollback_leaves_the_tracker_untouched() {
    let cluster = cluster();

    let tx = begin_read_only(&cluster);
    tx.rollback().await.unwrap();

    assert_eq!(cluster.tracker.get(), None);
    assert_eq!(
        cluster.manager.state_meta(tx.id()).map(|meta| meta.state),
        Some(TxState::Aborted)
    );
}

#[tokio::test]
async fn read_only_finish_is_idempotent() {
    let cluster = cluster();

    let tx = begin_read_only(&cluster);

    tx.commit().await.unwrap();
    // A later rollback is a no-op and cannot flip the recorded state.
    tx.rollback().await.unwrap();

    assert_eq!(
        cluster.manager.state_meta(tx.id()).map(|meta| meta.state),
        Some(TxState::Committed)
    );
}
