//! Transient per-transaction finish coordination state.

use crate::error::Result;
use lattice_common::Completion;

/// Outcome of the finish protocol, shared by every concurrent finisher.
pub(crate) type FinishOutcome = Result<()>;

/// In-memory context of a transaction with replicated writes in flight or a
/// finish in progress. Never persisted; created lazily and dropped with its
/// map entry. Mutated only through the context table's per-key entry lock.
#[derive(Debug, Default)]
pub(crate) struct TxContext {
    /// Replicated write operations dispatched but not yet acknowledged.
    pub inflights: u64,

    /// Completed once `inflights` reaches zero while a finish is pending.
    /// The commit path waits on this before choosing a commit timestamp.
    pub drain: Completion<()>,

    /// Set exactly once by the finisher that wins the compare-and-set;
    /// losers await the same completion. `Some` also marks the context as
    /// finishing, after which new inflights are refused.
    pub finish: Option<Completion<FinishOutcome>>,
}

impl TxContext {
    pub fn is_finishing(&self) -> bool {
        self.finish.is_some()
    }
}
