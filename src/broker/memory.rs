//! Process-local broker with partitions and consumer groups
//!
//! Records are appended to per-partition logs. Each (group, topic) pair keeps
//! a delivery cursor per partition, so a record is handed to exactly one
//! member of every group. Partition `p` belongs to the member at index
//! `p % members` in join order; membership changes rebalance immediately.

use super::{BrokerError, BrokerRecord, ConsumerClient, Subscription};
use crate::message::RecordPosition;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    payload: Bytes,
    timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct TopicLog {
    partitions: Vec<Vec<StoredRecord>>,
    closed: bool,
    next_partition: usize,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: vec![Vec::new(); partitions.max(1) as usize],
            closed: false,
            next_partition: 0,
        }
    }
}

#[derive(Debug, Default)]
struct GroupState {
    members: Vec<u64>,
    /// Next offset to deliver, per partition
    cursors: HashMap<i32, i64>,
    /// Next offset to consume after a restart, per partition
    committed: HashMap<i32, i64>,
}

impl GroupState {
    fn assigned(&self, member: u64, partitions: usize) -> Vec<i32> {
        let Some(index) = self.members.iter().position(|m| *m == member) else {
            return Vec::new();
        };
        let count = self.members.len();
        (0..partitions)
            .filter(|p| p % count == index)
            .map(|p| p as i32)
            .collect()
    }
}

#[derive(Debug)]
struct BrokerState {
    default_partitions: u32,
    topics: HashMap<String, TopicLog>,
    groups: HashMap<(String, String), GroupState>,
    failing_topics: HashSet<String>,
    unreachable: bool,
    next_member: u64,
}

impl BrokerState {
    fn topic_mut(&mut self, topic: &str) -> &mut TopicLog {
        let partitions = self.default_partitions;
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(partitions))
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    /// Bumped on every publish, close and membership change
    version: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// In-memory broker; clones share the same logs and groups
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Broker whose auto-created topics get `partitions` partitions
    pub fn with_partitions(partitions: u32) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    default_partitions: partitions.max(1),
                    topics: HashMap::new(),
                    groups: HashMap::new(),
                    failing_topics: HashSet::new(),
                    unreachable: false,
                    next_member: 0,
                }),
                version,
            }),
        }
    }

    /// Create `topic` with an explicit partition count; no-op if it exists
    pub fn create_topic(&self, topic: &str, partitions: u32) {
        self.shared
            .lock()
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(partitions));
    }

    /// Append a record; keyed records always land on the same partition
    pub fn publish<P: Into<Bytes>>(
        &self,
        topic: &str,
        key: Option<Bytes>,
        payload: P,
    ) -> RecordPosition {
        let position = {
            let mut state = self.shared.lock();
            let log = state.topic_mut(topic);
            let count = log.partitions.len();
            let partition = match &key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    (hasher.finish() % count as u64) as usize
                }
                None => {
                    let p = log.next_partition % count;
                    log.next_partition = log.next_partition.wrapping_add(1);
                    p
                }
            };
            append(log, topic, partition, key, payload.into())
        };
        self.shared.notify();
        position
    }

    /// Append a record to a specific partition
    pub fn publish_to<P: Into<Bytes>>(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        payload: P,
    ) -> RecordPosition {
        let position = {
            let mut state = self.shared.lock();
            let log = state.topic_mut(topic);
            let index = (partition.max(0) as usize).min(log.partitions.len() - 1);
            append(log, topic, index, key, payload.into())
        };
        self.shared.notify();
        position
    }

    /// End the topic's stream once members have consumed what is left
    pub fn close_topic(&self, topic: &str) {
        self.shared.lock().topic_mut(topic).closed = true;
        self.shared.notify();
    }

    /// Make every subsequent `subscribe` fail as if the broker were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.lock().unreachable = unreachable;
    }

    /// Make subsequent subscriptions to `topic` be rejected
    pub fn fail_subscriptions(&self, topic: &str) {
        self.shared.lock().failing_topics.insert(topic.to_string());
    }

    /// Committed offset (next to consume) for a group's partition
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.shared
            .lock()
            .groups
            .get(&(group.to_string(), topic.to_string()))
            .and_then(|g| g.committed.get(&partition).copied())
    }

    /// Current members of a group on a topic
    pub fn members(&self, group: &str, topic: &str) -> usize {
        self.shared
            .lock()
            .groups
            .get(&(group.to_string(), topic.to_string()))
            .map_or(0, |g| g.members.len())
    }

    /// Records stored for a topic across all partitions
    pub fn record_count(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .topics
            .get(topic)
            .map_or(0, |log| log.partitions.iter().map(Vec::len).sum())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("InMemoryBroker")
            .field("topics", &state.topics.len())
            .field("groups", &state.groups.len())
            .finish()
    }
}

fn append(
    log: &mut TopicLog,
    topic: &str,
    partition: usize,
    key: Option<Bytes>,
    payload: Bytes,
) -> RecordPosition {
    let records = &mut log.partitions[partition];
    records.push(StoredRecord {
        key,
        payload,
        timestamp: Utc::now(),
    });
    RecordPosition {
        topic: topic.to_string(),
        partition: partition as i32,
        offset: records.len() as i64 - 1,
    }
}

#[async_trait]
impl ConsumerClient for InMemoryBroker {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let member = {
            let mut state = self.shared.lock();
            if state.unreachable {
                return Err(BrokerError::Unreachable(
                    "in-memory broker marked unreachable".to_string(),
                ));
            }
            if state.failing_topics.contains(topic) {
                return Err(BrokerError::Rejected {
                    topic: topic.to_string(),
                    reason: "subscription failure injected".to_string(),
                });
            }

            state.topic_mut(topic);
            let member = state.next_member;
            state.next_member += 1;

            let group = state
                .groups
                .entry((group_id.to_string(), topic.to_string()))
                .or_default();
            group.members.push(member);
            member
        };
        self.shared.notify();

        debug!(topic = %topic, group = %group_id, member, "Joined in-memory consumer group");

        Ok(Box::new(InMemorySubscription {
            shared: self.shared.clone(),
            version: self.shared.version.subscribe(),
            topic: topic.to_string(),
            group: group_id.to_string(),
            member,
            left: false,
        }))
    }
}

enum Poll {
    Record(BrokerRecord),
    Ended,
    Pending,
}

struct InMemorySubscription {
    shared: Arc<Shared>,
    version: watch::Receiver<u64>,
    topic: String,
    group: String,
    member: u64,
    left: bool,
}

impl InMemorySubscription {
    fn group_key(&self) -> (String, String) {
        (self.group.clone(), self.topic.clone())
    }

    fn poll_once(&self) -> Poll {
        let mut state = self.shared.lock();
        let key = self.group_key();
        let BrokerState { topics, groups, .. } = &mut *state;

        let Some(log) = topics.get(&self.topic) else {
            return Poll::Pending;
        };
        let Some(group) = groups.get_mut(&key) else {
            return Poll::Ended;
        };

        for partition in group.assigned(self.member, log.partitions.len()) {
            let start = group.committed.get(&partition).copied().unwrap_or(0);
            let cursor = group.cursors.entry(partition).or_insert(start);
            if let Some(stored) = log.partitions[partition as usize].get(*cursor as usize) {
                let record = BrokerRecord {
                    topic: self.topic.clone(),
                    partition,
                    offset: *cursor,
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                    timestamp: Some(stored.timestamp),
                };
                *cursor += 1;
                return Poll::Record(record);
            }
        }

        if log.closed {
            Poll::Ended
        } else {
            Poll::Pending
        }
    }

    fn remove_member(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        let key = self.group_key();
        if let Some(group) = self.shared.lock().groups.get_mut(&key) {
            group.members.retain(|m| *m != self.member);
        }
        self.shared.notify();
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next_record(&mut self) -> Result<Option<BrokerRecord>, BrokerError> {
        loop {
            if self.left {
                return Err(BrokerError::Closed);
            }

            self.version.borrow_and_update();
            match self.poll_once() {
                Poll::Record(record) => return Ok(Some(record)),
                Poll::Ended => return Ok(None),
                Poll::Pending => {}
            }

            if self.version.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, position: &RecordPosition) -> Result<(), BrokerError> {
        if self.left {
            return Err(BrokerError::Closed);
        }

        let key = self.group_key();
        let mut state = self.shared.lock();
        let group = state
            .groups
            .get_mut(&key)
            .ok_or_else(|| BrokerError::Commit(format!("unknown group {}", self.group)))?;
        let next = position.offset + 1;
        let entry = group.committed.entry(position.partition).or_insert(next);
        *entry = (*entry).max(next);
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), BrokerError> {
        if !self.left {
            debug!(topic = %self.topic, group = %self.group, member = self.member, "Leaving in-memory consumer group");
        }
        self.remove_member();
        Ok(())
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        self.remove_member();
    }
}
