use crate::cache::{CacheError, CacheHandle};
use crate::message::{MessageEnvelope, RecordPosition, ShapeError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Per-invocation context handed to every agent handler
///
/// Carries the record metadata and the cache handle configured on the host,
/// so handlers never reach for process-wide state.
#[derive(Clone)]
pub struct AgentContext {
    position: RecordPosition,
    key: Option<Bytes>,
    timestamp: Option<DateTime<Utc>>,
    arrived_at: DateTime<Utc>,
    cache: Option<CacheHandle>,
}

impl AgentContext {
    pub fn from_envelope(envelope: &MessageEnvelope, cache: Option<CacheHandle>) -> Self {
        Self {
            position: envelope.position(),
            key: envelope.key().cloned(),
            timestamp: envelope.timestamp(),
            arrived_at: envelope.arrived_at(),
            cache,
        }
    }

    pub fn topic(&self) -> &str {
        &self.position.topic
    }

    pub fn partition(&self) -> i32 {
        self.position.partition
    }

    pub fn offset(&self) -> i64 {
        self.position.offset
    }

    pub fn position(&self) -> &RecordPosition {
        &self.position
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn arrived_at(&self) -> DateTime<Utc> {
        self.arrived_at
    }

    /// Shared cache handle, if the host configured one
    pub fn cache(&self) -> Result<&CacheHandle, CacheError> {
        self.cache.as_ref().ok_or(CacheError::NotConfigured)
    }

    /// Deserialize the payload without schema validation
    pub fn decode<T: DeserializeOwned>(&self, payload: &Value) -> Result<T, ShapeError> {
        Ok(T::deserialize(payload)?)
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("position", &self.position)
            .field("has_cache", &self.cache.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_context_carries_envelope_metadata() {
        let envelope =
            MessageEnvelope::new("orders", 3, 42, Some(Bytes::from_static(b"k")), "{}");
        let ctx = AgentContext::from_envelope(&envelope, None);

        assert_eq!(ctx.topic(), "orders");
        assert_eq!(ctx.partition(), 3);
        assert_eq!(ctx.offset(), 42);
        assert_eq!(ctx.key().map(|k| k.as_ref()), Some(&b"k"[..]));
        assert_eq!(ctx.arrived_at(), envelope.arrived_at());
    }

    #[test]
    fn test_cache_absent_is_error() {
        let envelope = MessageEnvelope::new("orders", 0, 0, None, "{}");
        let ctx = AgentContext::from_envelope(&envelope, None);

        assert!(matches!(ctx.cache(), Err(CacheError::NotConfigured)));
    }

    #[test]
    fn test_cache_present() {
        let envelope = MessageEnvelope::new("orders", 0, 0, None, "{}");
        let cache: CacheHandle = Arc::new(InMemoryCache::new());
        let ctx = AgentContext::from_envelope(&envelope, Some(cache));

        assert!(ctx.cache().is_ok());
    }

    #[test]
    fn test_decode_payload() {
        #[derive(Deserialize)]
        struct Order {
            orderid: u64,
        }

        let envelope = MessageEnvelope::new("orders", 0, 0, None, "{}");
        let ctx = AgentContext::from_envelope(&envelope, None);
        let order: Order = ctx.decode(&json!({"orderid": 18})).unwrap();
        assert_eq!(order.orderid, 18);
    }
}
