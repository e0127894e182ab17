//! Cache provider contract.
//!
//! A provider is a byte-oriented key/value store with per-entry TTL and
//! wildcard invalidation. Values are opaque to the provider; the
//! cache-consistent repositories serialize entities with `serde_json`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::key::{CacheKey, InvalidationPattern};

/// Errors raised by a cache provider.
///
/// These never become business errors: the cache-consistent repositories
/// log them and fall back to the authoritative store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to serialize cache value: {0}")]
    Serialization(String),

    #[error("Failed to deserialize cache value: {0}")]
    Deserialization(String),

    #[error("Invalid invalidation pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Cache provider trait for pluggable cache implementations.
///
/// Implementations must be safe to share between tasks. An expired entry
/// must be reported as absent by `get`.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Get the raw value stored under `key`, if present and unexpired.
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store `value` under `key` for `ttl`.
    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Remove every listed key. Absent keys are ignored.
    async fn delete(&self, keys: &[CacheKey]) -> Result<(), CacheError>;

    /// Remove every key matching `pattern`, returning how many were removed.
    async fn invalidate_pattern(&self, pattern: &InvalidationPattern) -> Result<u64, CacheError>;

    /// Get cache statistics.
    async fn stats(&self) -> Result<CacheStats, CacheError> {
        Ok(CacheStats::default())
    }
}

#[async_trait]
impl<C: CacheProvider + ?Sized> CacheProvider for Arc<C> {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, keys: &[CacheKey]) -> Result<(), CacheError> {
        (**self).delete(keys).await
    }

    async fn invalidate_pattern(&self, pattern: &InvalidationPattern) -> Result<u64, CacheError> {
        (**self).invalidate_pattern(pattern).await
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        (**self).stats().await
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, including expired entries.
    pub misses: u64,
    /// Number of entries currently held (expired entries not yet evicted
    /// included).
    pub entry_count: u64,
    /// Number of entries removed by explicit deletes and pattern invalidation.
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
