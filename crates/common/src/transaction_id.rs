//! Transaction identifiers derived from begin timestamps.

use lattice_hlc::HlcTimestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Globally unique transaction identifier.
///
/// The id embeds the begin timestamp, so the begin time is always
/// recoverable from the id alone, and the total order over ids is
/// consistent with begin-timestamp order. A per-generator sequence breaks
/// ties between transactions begun at the same timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    begin: HlcTimestamp,
    seq: u32,
}

impl TransactionId {
    /// Largest possible id, useful as an inclusive range upper bound.
    pub const MAX: TransactionId = TransactionId {
        begin: HlcTimestamp::MAX,
        seq: u32::MAX,
    };

    pub const fn new(begin: HlcTimestamp, seq: u32) -> Self {
        Self { begin, seq }
    }

    /// The timestamp at which this transaction began.
    pub fn begin_timestamp(&self) -> HlcTimestamp {
        self.begin
    }
}

impl PartialOrd for TransactionId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransactionId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.begin, self.seq).cmp(&(other.begin, other.seq))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:08x}", self.begin, self.seq)
    }
}

/// Produces transaction ids for a single coordinator node.
#[derive(Debug, Default)]
pub struct TransactionIdGenerator {
    seq: AtomicU32,
}

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self, begin_timestamp: HlcTimestamp) -> TransactionId {
        TransactionId::new(begin_timestamp, self.seq.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_hlc::NodeId;

    fn ts(physical: u64) -> HlcTimestamp {
        HlcTimestamp::new(physical, 0, NodeId::new(1))
    }

    #[test]
    fn order_follows_begin_timestamp() {
        let generator = TransactionIdGenerator::new();

        let early = generator.generate(ts(100));
        let late = generator.generate(ts(200));

        assert!(early < late);
        assert_eq!(early.begin_timestamp(), ts(100));
    }

    #[test]
    fn sequence_breaks_ties_at_one_timestamp() {
        let generator = TransactionIdGenerator::new();

        let first = generator.generate(ts(100));
        let second = generator.generate(ts(100));

        assert_ne!(first, second);
        assert!(first < second);
    }

    #[test]
    fn max_bounds_every_generated_id() {
        let generator = TransactionIdGenerator::new();

        for physical in [0, 1, u64::MAX / 2] {
            assert!(generator.generate(ts(physical)) < TransactionId::MAX);
        }
    }
}
