//! Commit bookkeeping for concurrent dispatch
//!
//! With several records in flight, completion order differs from offset
//! order. Only the highest offset below every still-pending record of a
//! partition is safe to commit.

use crate::message::RecordPosition;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct PartitionProgress {
    pending: BTreeSet<i64>,
    highest_done: Option<i64>,
    committed: Option<i64>,
}

impl PartitionProgress {
    fn committable(&self) -> Option<i64> {
        let done = self.highest_done?;
        let safe = match self.pending.first() {
            Some(&lowest_pending) if lowest_pending <= done => lowest_pending - 1,
            _ => done,
        };
        match self.committed {
            Some(committed) if committed >= safe => None,
            _ if safe < 0 => None,
            _ => Some(safe),
        }
    }
}

/// Tracks pulled and finished offsets per partition of one topic
#[derive(Debug)]
pub struct CommitTracker {
    topic: String,
    partitions: HashMap<i32, PartitionProgress>,
}

impl CommitTracker {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partitions: HashMap::new(),
        }
    }

    /// A record was pulled and its dispatch is starting
    pub fn begin(&mut self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .or_default()
            .pending
            .insert(offset);
    }

    /// A record's dispatch finished; returns a position that may now be committed
    pub fn complete(&mut self, partition: i32, offset: i64) -> Option<RecordPosition> {
        let progress = self.partitions.entry(partition).or_default();
        progress.pending.remove(&offset);
        progress.highest_done = Some(progress.highest_done.map_or(offset, |d| d.max(offset)));

        let safe = progress.committable()?;
        progress.committed = Some(safe);
        Some(RecordPosition {
            topic: self.topic.clone(),
            partition,
            offset: safe,
        })
    }

    /// Records pulled but not yet finished
    pub fn pending(&self) -> usize {
        self.partitions.values().map(|p| p.pending.len()).sum()
    }
}
