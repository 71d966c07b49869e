//! Forward-only tracker of the latest observed timestamp.

use lattice_hlc::HlcTimestamp;
use parking_lot::Mutex;

/// Tracks the highest timestamp a client session has observed.
///
/// Read-only transactions start no earlier than the tracked value, and a
/// successful commit advances it to the commit timestamp so causally
/// dependent operations see their own writes. The tracker only ever moves
/// forward.
#[derive(Debug, Default)]
pub struct TimestampTracker {
    observed: Mutex<Option<HlcTimestamp>>,
}

impl TimestampTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<HlcTimestamp> {
        *self.observed.lock()
    }

    pub fn update(&self, timestamp: HlcTimestamp) {
        let mut observed = self.observed.lock();

        match *observed {
            Some(current) if current >= timestamp => {}
            _ => *observed = Some(timestamp),
        }
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
    fn tracker_only_moves_forward() {
        let tracker = TimestampTracker::new();
        assert_eq!(tracker.get(), None);

        tracker.update(ts(100));
        assert_eq!(tracker.get(), Some(ts(100)));

        tracker.update(ts(50));
        assert_eq!(tracker.get(), Some(ts(100)));

        tracker.update(ts(150));
        assert_eq!(tracker.get(), Some(ts(150)));
    }
}
