//! In-process cache provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::key::{CacheKey, InvalidationPattern};
use super::provider::{CacheError, CacheProvider, CacheStats};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// `HashMap`-backed provider with per-entry expiry.
///
/// Expired entries are reported as absent and evicted lazily, on the next
/// `get` of the same key or on [`InMemoryCacheProvider::purge_expired`].
#[derive(Debug, Default)]
pub struct InMemoryCacheProvider {
    entries: RwLock<HashMap<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl InMemoryCacheProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// True if `key` holds an unexpired value. Does not touch the statistics.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .get(key.as_str())
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Drop every expired entry, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    /// Remove everything.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl CacheProvider for InMemoryCacheProvider {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key.as_str()) {
                Some(entry) if !entry.is_expired(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
            }
        }

        // Expired: evict unless a concurrent set already replaced it.
        let mut entries = self.entries.write().await;
        if entries
            .get(key.as_str())
            .is_some_and(|e| e.is_expired(Instant::now()))
        {
            entries.remove(key.as_str());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry {
            value,
            expires_at: Instant::now().checked_add(ttl),
        };
        self.entries
            .write()
            .await
            .insert(key.as_str().to_string(), entry);
        Ok(())
    }

    async fn delete(&self, keys: &[CacheKey]) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        let removed = keys
            .iter()
            .filter(|k| entries.remove(k.as_str()).is_some())
            .count();
        self.invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn invalidate_pattern(&self, pattern: &InvalidationPattern) -> Result<u64, CacheError> {
        let mut entries = self.entries.write().await;
        let removed = if pattern.is_literal() {
            u64::from(entries.remove(pattern.as_str()).is_some())
        } else {
            let regex = pattern.to_regex()?;
            let before = entries.len();
            entries.retain(|k, _| !regex.is_match(k));
            (before - entries.len()) as u64
        };
        self.invalidations.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.read().await.len() as u64,
            invalidations: self.invalidations.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_core::{FieldId, RecordId, TableId};

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = InMemoryCacheProvider::new();
        let key = CacheKey::field_by_id(&FieldId::new("f1"));

        assert_eq!(cache.get(&key).await.unwrap(), None);
        cache.set(&key, b"payload".to_vec(), TTL).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(b"payload".to_vec()));

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_and_evicted() {
        let cache = InMemoryCacheProvider::new();
        let key = CacheKey::field_by_id(&FieldId::new("f1"));

        cache
            .set(&key, b"old".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.get(&key).await.unwrap(), None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live_entries() {
        let cache = InMemoryCacheProvider::new();
        let short = CacheKey::field_by_id(&FieldId::new("short"));
        let long = CacheKey::field_by_id(&FieldId::new("long"));

        cache.set(&short, vec![1], Duration::from_millis(10)).await.unwrap();
        cache.set(&long, vec![2], TTL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.purge_expired().await, 1);
        assert!(cache.contains(&long).await);
    }

    #[tokio::test]
    async fn test_delete_ignores_absent_keys() {
        let cache = InMemoryCacheProvider::new();
        let present = CacheKey::field_by_id(&FieldId::new("f1"));
        let absent = CacheKey::field_by_id(&FieldId::new("f2"));

        cache.set(&present, vec![1], TTL).await.unwrap();
        cache.delete(&[present.clone(), absent]).await.unwrap();

        assert!(!cache.contains(&present).await);
        assert_eq!(cache.stats().await.unwrap().invalidations, 1);
    }

    #[tokio::test]
    async fn test_invalidate_pattern_counts_removed_entries() {
        let cache = InMemoryCacheProvider::new();
        let t1 = TableId::new("t1");
        let t2 = TableId::new("t2");
        let point = CacheKey::record_by_id(&t1, &RecordId::new("r1"));

        for key in [
            CacheKey::records_by_table(&t1),
            CacheKey::record_page(&t1, 10, 0),
            CacheKey::record_page(&t1, 10, 10),
            CacheKey::record_page(&t2, 10, 0),
            point.clone(),
        ] {
            cache.set(&key, vec![0], TTL).await.unwrap();
        }

        let removed = cache
            .invalidate_pattern(&InvalidationPattern::record_listings_of_table(&t1))
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert!(cache.contains(&point).await);
        assert!(cache.contains(&CacheKey::record_page(&t2, 10, 0)).await);
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_never_expires() {
        let cache = InMemoryCacheProvider::new();
        let key = CacheKey::field_by_id(&FieldId::new("f1"));

        cache
            .set(&key, b"kept".to_vec(), Duration::from_secs(u64::MAX))
            .await
            .unwrap();

        assert_eq!(cache.get(&key).await.unwrap(), Some(b"kept".to_vec()));
        assert_eq!(cache.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn test_literal_pattern_removes_single_key() {
        let cache = InMemoryCacheProvider::new();
        let t1 = TableId::new("t1");
        cache
            .set(&CacheKey::fields_by_table(&t1), vec![0], TTL)
            .await
            .unwrap();

        let removed = cache
            .invalidate_pattern(&InvalidationPattern::fields_of_table(&t1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(cache.is_empty().await);
    }
}
