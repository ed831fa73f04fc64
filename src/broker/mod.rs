//! Broker collaborators
//!
//! A [`ConsumerClient`] attaches to a topic as a member of a consumer group
//! and hands back a [`Subscription`]: a pull-based stream of records with
//! commit and leave-group operations. Partition assignment belongs to the
//! broker; the engine only sees records.

pub mod memory;
pub mod mqtt;

pub use memory::InMemoryBroker;
pub use mqtt::MqttBroker;

use crate::message::{MessageEnvelope, RecordPosition};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Broker client failures
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),
    #[error("Subscription to '{topic}' rejected: {reason}")]
    Rejected { topic: String, reason: String },
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
    #[error("Commit failed: {0}")]
    Commit(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Subscription already left the group")]
    Closed,
}

/// A record as delivered by the broker client
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp: Option<DateTime<Utc>>,
}

impl BrokerRecord {
    pub fn position(&self) -> RecordPosition {
        RecordPosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    pub fn into_envelope(self) -> MessageEnvelope {
        let envelope = MessageEnvelope::new(
            self.topic,
            self.partition,
            self.offset,
            self.key,
            self.payload,
        );
        match self.timestamp {
            Some(ts) => envelope.with_timestamp(ts),
            None => envelope,
        }
    }
}

/// One consumer-group membership on one topic
#[async_trait]
pub trait Subscription: Send {
    fn topic(&self) -> &str;

    /// Next record; `Ok(None)` once the stream has ended
    async fn next_record(&mut self) -> Result<Option<BrokerRecord>, BrokerError>;

    /// Mark `position` and everything before it on that partition as processed
    async fn commit(&mut self, position: &RecordPosition) -> Result<(), BrokerError>;

    /// Leave the group so partitions can be reassigned; idempotent
    async fn leave(&mut self) -> Result<(), BrokerError>;
}

/// Factory for subscriptions
#[async_trait]
pub trait ConsumerClient: Send + Sync {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Join `group_id` on `topic`; fails if the broker cannot be reached or
    /// refuses the subscription
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError>;
}
