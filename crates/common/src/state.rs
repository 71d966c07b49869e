//! Transaction state machine and per-transaction state metadata.

use crate::Completion;
use lattice_hlc::HlcTimestamp;
use serde::{Deserialize, Serialize};

/// Coordinator-side state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    /// Transaction is running and may still enlist partitions.
    Pending,
    /// Finish protocol has started; the outcome is not yet durable.
    Finishing,
    /// Terminal: the transaction committed.
    Committed,
    /// Terminal: the transaction was rolled back.
    Aborted,
}

impl TxState {
    pub fn is_final(self) -> bool {
        matches!(self, TxState::Committed | TxState::Aborted)
    }

    /// Whether moving from `before` to `after` is a legal transition.
    ///
    /// Terminal states never change, and once finishing has been observed
    /// the state cannot fall back to pending. An illegal transition is a
    /// programming error on the caller's side; state updates treat it as a
    /// no-op rather than corrupting the record.
    pub fn transition_allowed(before: Option<TxState>, after: TxState) -> bool {
        match before {
            None => true,
            Some(TxState::Pending) => true,
            Some(TxState::Finishing) => after != TxState::Pending,
            Some(terminal) => terminal == after,
        }
    }
}

/// Signal carrying the final state metadata once the finish protocol for a
/// transaction concludes.
pub type FinishWatch = Completion<TxStateMeta>;

/// State metadata tracked per transaction id.
#[derive(Debug, Clone)]
pub struct TxStateMeta {
    pub state: TxState,
    /// Node coordinating this transaction.
    pub coordinator: String,
    /// Set only when the transaction committed.
    pub commit_timestamp: Option<HlcTimestamp>,
    /// Present only while `state` is [`TxState::Finishing`]. Observers that
    /// need the outcome await this instead of polling the state table.
    pub finishing: Option<FinishWatch>,
}

impl TxStateMeta {
    pub fn pending(coordinator: String) -> Self {
        Self {
            state: TxState::Pending,
            coordinator,
            commit_timestamp: None,
            finishing: None,
        }
    }

    pub fn finishing(coordinator: String, watch: FinishWatch) -> Self {
        Self {
            state: TxState::Finishing,
            coordinator,
            commit_timestamp: None,
            finishing: Some(watch),
        }
    }

    pub fn finished(
        commit: bool,
        coordinator: String,
        commit_timestamp: Option<HlcTimestamp>,
    ) -> Self {
        Self {
            state: if commit {
                TxState::Committed
            } else {
                TxState::Aborted
            },
            coordinator,
            commit_timestamp: if commit { commit_timestamp } else { None },
            finishing: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_sticky() {
        for terminal in [TxState::Committed, TxState::Aborted] {
            assert!(TxState::transition_allowed(Some(terminal), terminal));

            for other in [TxState::Pending, TxState::Finishing] {
                assert!(!TxState::transition_allowed(Some(terminal), other));
            }
        }

        assert!(!TxState::transition_allowed(
            Some(TxState::Committed),
            TxState::Aborted
        ));
    }

    #[test]
    fn finishing_cannot_fall_back_to_pending() {
        assert!(!TxState::transition_allowed(
            Some(TxState::Finishing),
            TxState::Pending
        ));
        assert!(TxState::transition_allowed(
            Some(TxState::Finishing),
            TxState::Committed
        ));
        assert!(TxState::transition_allowed(
            Some(TxState::Finishing),
            TxState::Aborted
        ));
    }

    #[test]
    fn pending_may_move_anywhere() {
        for after in [
            TxState::Pending,
            TxState::Finishing,
            TxState::Committed,
            TxState::Aborted,
        ] {
            assert!(TxState::transition_allowed(Some(TxState::Pending), after));
            assert!(TxState::transition_allowed(None, after));
        }
    }

    #[test]
    fn finished_meta_drops_commit_timestamp_on_rollback() {
        let ts = HlcTimestamp::new(10, 0, lattice_hlc::NodeId::new(1));

        let committed = TxStateMeta::finished(true, "n1".into(), Some(ts));
        assert_eq!(committed.state, TxState::Committed);
        assert_eq!(committed.commit_timestamp, Some(ts));

        let aborted = TxStateMeta::finished(false, "n1".into(), Some(ts));
        assert_eq!(aborted.state, TxState::Aborted);
        assert_eq!(aborted.commit_timestamp, None);
    }
}
