//! Commit-point bookkeeping for out-of-order acks.
//!
//! Deliveries from one partition are handed out in offset order but settled
//! in whatever order their handlers finish. Kafka only stores one offset per
//! partition, so the committed offset may only move past a message once it
//! and every message before it are settled.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct PartitionOffsets {
    outstanding: BTreeSet<i64>,
    highest_seen: Option<i64>,
    committed: Option<i64>,
}

impl PartitionOffsets {
    fn commit_point(&self) -> Option<i64> {
        match self.outstanding.first() {
            Some(&lowest) => Some(lowest),
            None => self.highest_seen.map(|offset| offset + 1),
        }
    }
}

/// Tracks handed-out and settled offsets per topic partition.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `offset` was handed out and is not settled yet.
    pub fn track(&mut self, topic: &str, partition: i32, offset: i64) {
        let entry = self.partitions.entry((topic.to_string(), partition)).or_default();
        entry.outstanding.insert(offset);
        entry.highest_seen = Some(entry.highest_seen.map_or(offset, |seen| seen.max(offset)));
    }

    /// Record that `offset` is settled.
    ///
    /// Returns the offset to commit (the next offset to read) if the commit
    /// point moved forward.
    pub fn settle(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let entry = self.partitions.get_mut(&(topic.to_string(), partition))?;
        entry.outstanding.remove(&offset);

        let point = entry.commit_point()?;
        if entry.committed.is_some_and(|committed| committed >= point) {
            return None;
        }
        entry.committed = Some(point);
        Some(point)
    }

    /// Number of handed-out deliveries not settled yet.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.partitions.values().map(|p| p.outstanding.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn in_order_acks_advance_one_by_one() {
        let mut tracker = OffsetTracker::new();
        tracker.track("payment_events", 0, 10);
        tracker.track("payment_events", 0, 11);

        assert_eq!(tracker.settle("payment_events", 0, 10), Some(11));
        assert_eq!(tracker.settle("payment_events", 0, 11), Some(12));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn later_ack_waits_for_earlier_one() {
        let mut tracker = OffsetTracker::new();
        for offset in 5..8 {
            tracker.track("t", 1, offset);
        }

        assert_eq!(tracker.settle("t", 1, 7), None);
        assert_eq!(tracker.settle("t", 1, 6), None);
        assert_eq!(tracker.settle("t", 1, 5), Some(8));
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        tracker.track("t", 0, 1);
        tracker.track("t", 1, 1);

        assert_eq!(tracker.settle("t", 1, 1), Some(2));
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn unknown_partition_is_ignored() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.settle("t", 3, 1), None);
    }

    proptest! {
        #[test]
        fn commit_never_passes_an_unsettled_offset(order in Just((0i64..20).collect::<Vec<_>>()).prop_shuffle()) {
            let mut tracker = OffsetTracker::new();
            for offset in 0..20 {
                tracker.track("t", 0, offset);
            }

            let mut settled = BTreeSet::new();
            let mut last = None;
            for offset in order {
                settled.insert(offset);
                if let Some(point) = tracker.settle("t", 0, offset) {
                    prop_assert!((0..point).all(|o| settled.contains(&o)));
                    prop_assert!(last.is_none_or(|l| point > l));
                    last = Some(point);
                }
            }
            prop_assert_eq!(last, Some(20));
        }
    }
}
