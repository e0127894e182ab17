//! Cache-aside plumbing shared by the cache-consistent repositories.
//!
//! Every method here swallows provider failures: they are logged at warning
//! level, counted, and reported to the caller as a plain miss.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tabula_core::{metrics, CacheOutcome, EntityKind};

use super::key::{CacheKey, InvalidationPattern};
use super::provider::CacheProvider;

/// Which read class a cached lookup belongs to, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    Point,
    Collection,
    Page,
}

impl ReadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Point => "point",
            Self::Collection => "collection",
            Self::Page => "page",
        }
    }
}

/// Degradation-tolerant view over a cache provider for one entity kind.
pub struct CacheAside<C: ?Sized> {
    cache: Arc<C>,
    entity: EntityKind,
}

impl<C: ?Sized> Clone for CacheAside<C> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            entity: self.entity,
        }
    }
}

impl<C: CacheProvider + ?Sized> CacheAside<C> {
    pub fn new(cache: Arc<C>, entity: EntityKind) -> Self {
        Self { cache, entity }
    }

    pub fn provider(&self) -> &Arc<C> {
        &self.cache
    }

    fn count(&self, kind: ReadKind, outcome: CacheOutcome) {
        if let Some(m) = metrics() {
            m.record_cache_read(self.entity.as_str(), kind.as_str(), outcome);
        }
    }

    /// Record a read that skipped the cache because it ran in a transaction.
    pub fn note_bypass(&self, kind: ReadKind) {
        tracing::debug!(
            entity = self.entity.as_str(),
            read_kind = kind.as_str(),
            "Cache bypassed inside transaction"
        );
        self.count(kind, CacheOutcome::Bypass);
    }

    /// Look `key` up. `None` on miss, on provider failure and on an
    /// undecodable payload.
    pub async fn read<T: DeserializeOwned>(&self, key: &CacheKey, kind: ReadKind) -> Option<T> {
        let bytes = match self.cache.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::debug!(cache_key = %key, "Cache miss");
                self.count(kind, CacheOutcome::Miss);
                return None;
            }
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Cache read failed, using store");
                self.count(kind, CacheOutcome::Degraded);
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                tracing::debug!(cache_key = %key, "Cache hit");
                self.count(kind, CacheOutcome::Hit);
                Some(value)
            }
            Err(e) => {
                tracing::warn!(
                    cache_key = %key,
                    error = %e,
                    "Undecodable cache entry, using store"
                );
                self.count(kind, CacheOutcome::Degraded);
                None
            }
        }
    }

    /// Store `value` under `key`. Failures are logged only.
    pub async fn populate<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = self.cache.set(key, bytes, ttl).await {
            tracing::warn!(cache_key = %key, error = %e, "Failed to populate cache");
        }
    }

    /// Delete `keys`, then every pattern in order. Each step runs even if an
    /// earlier one failed.
    pub async fn invalidate(&self, keys: &[CacheKey], patterns: &[InvalidationPattern]) {
        if !keys.is_empty() {
            let result = self.cache.delete(keys).await;
            if let Err(e) = &result {
                tracing::warn!(
                    entity = self.entity.as_str(),
                    keys = keys.len(),
                    error = %e,
                    "Cache key invalidation failed"
                );
            }
            self.count_invalidation(result.is_ok());
        }

        for pattern in patterns {
            let result = self.cache.invalidate_pattern(pattern).await;
            match &result {
                Ok(removed) => tracing::debug!(
                    pattern = %pattern,
                    removed,
                    "Cache pattern invalidated"
                ),
                Err(e) => tracing::warn!(
                    pattern = %pattern,
                    error = %e,
                    "Cache pattern invalidation failed"
                ),
            }
            self.count_invalidation(result.is_ok());
        }
    }

    fn count_invalidation(&self, ok: bool) {
        if let Some(m) = metrics() {
            m.record_invalidation(self.entity.as_str(), ok);
        }
    }
}
