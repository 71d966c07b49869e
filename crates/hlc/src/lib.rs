//! Hybrid logical clock used for transaction ordering.
//!
//! Timestamps combine physical time with a logical counter so that causally
//! related events compare consistently across nodes, even when physical
//! clocks drift within the configured skew bound.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Upper bound on physical clock drift between any two nodes in the cluster.
///
/// Safe read timestamps are shifted backwards by at least this much so that
/// every replica has already observed a safe time at or above them.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_millis(500);

/// Identifier of the node that generated a timestamp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(id: u64) -> Self {
        NodeId(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Immutable hybrid logical timestamp with a total order.
///
/// Ordering is physical time, then logical counter, then node id. The node
/// id tie-break makes timestamps produced by different nodes at the same
/// instant comparable in a deterministic way.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HlcTimestamp {
    /// Physical component, microseconds since the Unix epoch.
    pub physical: u64,
    /// Logical counter disambiguating timestamps within one physical tick.
    pub logical: u32,
    /// Node that generated this timestamp.
    pub node_id: NodeId,
}

impl HlcTimestamp {
    /// Smallest possible timestamp.
    pub const MIN: HlcTimestamp = HlcTimestamp::new(0, 0, NodeId::new(0));

    /// Largest possible timestamp, useful as a range upper bound.
    pub const MAX: HlcTimestamp = HlcTimestamp::new(u64::MAX, u32::MAX, NodeId::new(u64::MAX));

    pub const fn new(physical: u64, logical: u32, node_id: NodeId) -> Self {
        Self {
            physical,
            logical,
            node_id,
        }
    }

    /// Timestamp shifted backwards by `amount` of physical time.
    ///
    /// The logical counter is zeroed: the result is a conservative lower
    /// bound, not a point on this node's timeline. Saturates at the epoch.
    pub fn shift_back(&self, amount: Duration) -> HlcTimestamp {
        let micros = amount.as_micros() as u64;

        HlcTimestamp::new(self.physical.saturating_sub(micros), 0, self.node_id)
    }

    /// Single `u64` view of this timestamp, physical time in nanoseconds
    /// plus the logical counter. Used where a compact token is needed.
    pub fn as_nanos(&self) -> u64 {
        self.physical * 1_000 + self.logical as u64
    }
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.physical, self.logical, self.node_id).cmp(&(
            other.physical,
            other.logical,
            other.node_id,
        ))
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.physical, self.logical, self.node_id)
    }
}

/// Clock generating monotonically increasing hybrid timestamps.
///
/// `now` never returns a value smaller than a previously returned one, and
/// `update` folds in timestamps received from other nodes so that causality
/// is preserved across messages.
pub struct HlcClock {
    node_id: NodeId,
    /// Last issued (physical, logical) tick. A single lock keeps the
    /// read-compare-advance sequence atomic, so concurrent callers can
    /// never mint the same timestamp twice.
    last: Mutex<(u64, u32)>,
}

impl HlcClock {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            last: Mutex::new((0, 0)),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Generate the next timestamp.
    pub fn now(&self) -> HlcTimestamp {
        let physical = Self::wall_clock_micros();

        let mut last = self.last.lock();

        if physical > last.0 {
            *last = (physical, 0);
        } else {
            // Wall clock has not advanced past the last issued tick, so
            // uniqueness comes from the logical counter.
            last.1 += 1;
        }

        HlcTimestamp::new(last.0, last.1, self.node_id)
    }

    /// Advance the clock past a timestamp observed on another node.
    pub fn update(&self, received: &HlcTimestamp) -> HlcTimestamp {
        let physical = Self::wall_clock_micros();

        let mut last = self.last.lock();
        let max_physical = physical.max(received.physical).max(last.0);

        if max_physical > last.0 {
            let logical = if received.physical >= max_physical {
                // Remote clock is ahead, continue its logical sequence.
                received.logical + 1
            } else {
                0
            };

            *last = (max_physical, logical);
        } else {
            last.1 = last.1.max(received.logical) + 1;
        }

        HlcTimestamp::new(last.0, last.1, self.node_id)
    }

    fn wall_clock_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_total_order() {
        let node1 = NodeId::new(1);
        let node2 = NodeId::new(2);

        let ts1 = HlcTimestamp::new(100, 0, node1);
        let ts2 = HlcTimestamp::new(100, 1, node1);
        let ts3 = HlcTimestamp::new(101, 0, node1);
        let ts4 = HlcTimestamp::new(100, 0, node2);

        assert!(ts1 < ts2);
        assert!(ts2 < ts3);
        assert!(ts1 < ts4);
        assert!(ts4 < ts3);
    }

    #[test]
    fn min_and_max_bound_everything() {
        let ts = HlcTimestamp::new(42, 7, NodeId::new(3));

        assert!(HlcTimestamp::MIN < ts);
        assert!(ts < HlcTimestamp::MAX);
    }

    #[test]
    fn shift_back_saturates() {
        let node = NodeId::new(1);
        let ts = HlcTimestamp::new(5_000_000, 9, node);

        let shifted = ts.shift_back(Duration::from_secs(2));
        assert_eq!(shifted, HlcTimestamp::new(3_000_000, 0, node));

        let floored = ts.shift_back(Duration::from_secs(60));
        assert_eq!(floored, HlcTimestamp::new(0, 0, node));
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = HlcClock::new(NodeId::new(1));

        let ts1 = clock.now();
        let ts2 = clock.now();
        let ts3 = clock.now();

        assert!(ts1 < ts2);
        assert!(ts2 < ts3);
    }

    #[test]
    fn concurrent_callers_never_share_a_timestamp() {
        use std::sync::Arc;

        let clock = Arc::new(HlcClock::new(NodeId::new(1)));

        let minters: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || (0..1_000).map(|_| clock.now()).collect::<Vec<_>>())
            })
            .collect();

        let mut issued: Vec<HlcTimestamp> = Vec::new();
        for minter in minters {
            issued.extend(minter.join().unwrap());
        }

        issued.sort();
        issued.dedup();
        assert_eq!(issued.len(), 4_000);
    }

    #[test]
    fn update_moves_past_remote_timestamp() {
        let clock = HlcClock::new(NodeId::new(1));

        let far_ahead = HlcTimestamp::new(u64::MAX / 2, 3, NodeId::new(2));
        let merged = clock.update(&far_ahead);

        assert!(merged > far_ahead);
        assert!(clock.now() > far_ahead);
    }
}
