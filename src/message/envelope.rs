use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a record inside a topic partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for RecordPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{} | {}]", self.topic, self.partition, self.offset)
    }
}

/// One consumed record: metadata plus raw payload
///
/// Envelopes are constructed by the consumption loop and owned by the
/// dispatch call that receives them. Nothing retains them afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Bytes>,
    payload: Bytes,
    /// Broker-assigned timestamp, when the broker provides one
    timestamp: Option<DateTime<Utc>>,
    arrived_at: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new<T: Into<String>, P: Into<Bytes>>(
        topic: T,
        partition: i32,
        offset: i64,
        key: Option<Bytes>,
        payload: P,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key,
            payload: payload.into(),
            timestamp: None,
            arrived_at: Utc::now(),
        }
    }

    /// Attach the broker timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    /// Lossy UTF-8 rendering of the key for log lines
    pub fn key_str(&self) -> Option<String> {
        self.key
            .as_ref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn arrived_at(&self) -> DateTime<Utc> {
        self.arrived_at
    }

    pub fn position(&self) -> RecordPosition {
        RecordPosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_accessors() {
        let envelope = MessageEnvelope::new(
            "orders",
            4,
            60,
            Some(Bytes::from_static(b"18")),
            r#"{"orderid": 18}"#,
        );

        assert_eq!(envelope.topic(), "orders");
        assert_eq!(envelope.partition(), 4);
        assert_eq!(envelope.offset(), 60);
        assert_eq!(envelope.key_str().as_deref(), Some("18"));
        assert_eq!(envelope.payload().as_ref(), br#"{"orderid": 18}"#);
        assert!(envelope.timestamp().is_none());
        assert!(envelope.arrived_at() <= Utc::now());
    }

    #[test]
    fn test_position_display() {
        let envelope = MessageEnvelope::new("orders", 2, 7, None, "{}");
        let position = envelope.position();

        assert_eq!(position.to_string(), "orders[2 | 7]");
        assert_eq!(
            position,
            RecordPosition {
                topic: "orders".to_string(),
                partition: 2,
                offset: 7
            }
        );
    }

    #[test]
    fn test_with_timestamp() {
        let ts = Utc::now();
        let envelope = MessageEnvelope::new("t", 0, 0, None, "null").with_timestamp(ts);
        assert_eq!(envelope.timestamp(), Some(ts));
    }

    #[test]
    fn test_absent_key() {
        let envelope = MessageEnvelope::new("t", 0, 0, None, "null");
        assert!(envelope.key().is_none());
        assert!(envelope.key_str().is_none());
    }
}
