//! Key/value cache shared by agent handlers
//!
//! Two interchangeable backends sit behind one trait. The engine never
//! coordinates between them: a host picks one at startup and handlers see
//! only the [`CacheHandle`].

mod memory;
mod redis_cache;

pub use memory::InMemoryCache;
pub use redis_cache::{RedisCache, RedisTarget};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Cache failures
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache is not configured")]
    NotConfigured,
    #[error("Cache backend '{0}' is not connected")]
    NotConnected(&'static str),
    #[error("Invalid cache target: {0}")]
    InvalidTarget(String),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Opaque string-keyed store; implementations provide their own
/// concurrency safety
#[async_trait]
pub trait Cache: Send + Sync {
    /// Short backend name for logs and health output
    fn backend(&self) -> &'static str;

    async fn connect(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    async fn set(&self, key: &str, value: Bytes) -> Result<(), CacheError>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
}

/// Shared handle to the configured cache
pub type CacheHandle = Arc<dyn Cache>;
