//! LMDB-backed cache provider.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep the cache in a
//! memory-mapped file that survives process restarts.
//!
//! # Value Layout
//!
//! `[expires_at_millis: 8 bytes big-endian][payload]`
//!
//! Expiry is checked on read; an expired entry is deleted and reported as
//! absent. Pattern invalidation scans the key space under a read
//! transaction, then deletes the matches in a single write transaction.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use tabula_core::StorageConfig;

use super::key::{CacheKey, InvalidationPattern};
use super::provider::{CacheError, CacheProvider, CacheStats};

const HEADER_LEN: usize = 8;

/// Error type for LMDB environment setup and transactions.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// No LMDB path configured.
    #[error("LMDB cache path is not configured")]
    NotConfigured,

    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for CacheError {
    fn from(e: LmdbCacheError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

fn txn_error(e: heed::Error) -> LmdbCacheError {
    LmdbCacheError::Transaction(e.to_string())
}

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

fn encode_value(value: &[u8], ttl: Duration) -> Vec<u8> {
    let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    let expires_at = now_millis().saturating_add(ttl_millis);
    let mut bytes = Vec::with_capacity(HEADER_LEN + value.len());
    bytes.extend_from_slice(&expires_at.to_be_bytes());
    bytes.extend_from_slice(value);
    bytes
}

/// Split a stored value into its expiry and payload. `None` if malformed.
fn decode_value(bytes: &[u8]) -> Option<(u64, &[u8])> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);
    let expires_at = u64::from_be_bytes(header.try_into().ok()?);
    Some((expires_at, payload))
}

/// Cache provider persisted in an LMDB environment.
pub struct LmdbCacheProvider {
    env: Env,
    db: Database<Bytes, Bytes>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl LmdbCacheProvider {
    /// Open (or create) an LMDB cache in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the LMDB
    /// environment or database cannot be opened.
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        let map_size = max_size_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| LmdbCacheError::EnvOpen(format!("map size of {max_size_mb} MB overflows")))?;
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per provider and the
        // directory is not shared with another map of a different size.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_error)?;

        Ok(Self {
            env,
            db,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        })
    }

    /// Open the provider described by `config.lmdb_path`.
    pub fn from_config(config: &StorageConfig) -> Result<Self, LmdbCacheError> {
        let path = config
            .lmdb_path
            .as_ref()
            .ok_or(LmdbCacheError::NotConfigured)?;
        Self::new(path, config.lmdb_max_size_mb)
    }

    fn collect_matching_keys(
        &self,
        pattern: &InvalidationPattern,
    ) -> Result<Vec<Vec<u8>>, CacheError> {
        let regex = pattern.to_regex()?;
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let iter = self.db.iter(&rtxn).map_err(txn_error)?;

        let mut keys = Vec::new();
        for result in iter {
            let (key, _) = result.map_err(txn_error)?;
            if std::str::from_utf8(key).is_ok_and(|k| regex.is_match(k)) {
                keys.push(key.to_vec());
            }
        }
        Ok(keys)
    }

    fn delete_raw(&self, keys: &[&[u8]]) -> Result<u64, CacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let mut deleted = 0u64;
        for key in keys {
            if self.db.delete(&mut wtxn, key).map_err(txn_error)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(txn_error)?;
        Ok(deleted)
    }

    fn entry_count(&self) -> Result<u64, CacheError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        Ok(self.db.len(&rtxn).map_err(txn_error)?)
    }
}

#[async_trait]
impl CacheProvider for LmdbCacheProvider {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let expired = {
            let rtxn = self.env.read_txn().map_err(txn_error)?;
            match self.db.get(&rtxn, key.as_bytes()).map_err(txn_error)? {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Some(bytes) => {
                    let (expires_at, payload) = decode_value(bytes).ok_or_else(|| {
                        CacheError::Deserialization(format!("malformed entry under {}", key))
                    })?;
                    if expires_at > now_millis() {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(Some(payload.to_vec()));
                    }
                    true
                }
            }
        };

        if expired {
            self.delete_raw(&[key.as_bytes()])?;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let bytes = encode_value(&value, ttl);
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(())
    }

    async fn delete(&self, keys: &[CacheKey]) -> Result<(), CacheError> {
        let raw: Vec<&[u8]> = keys.iter().map(CacheKey::as_bytes).collect();
        let deleted = self.delete_raw(&raw)?;
        self.invalidations.fetch_add(deleted, Ordering::Relaxed);
        Ok(())
    }

    async fn invalidate_pattern(&self, pattern: &InvalidationPattern) -> Result<u64, CacheError> {
        let keys = if pattern.is_literal() {
            vec![pattern.as_str().as_bytes().to_vec()]
        } else {
            self.collect_matching_keys(pattern)?
        };
        let raw: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        let deleted = self.delete_raw(&raw)?;
        self.invalidations.fetch_add(deleted, Ordering::Relaxed);
        Ok(deleted)
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entry_count()?,
            invalidations: self.invalidations.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tabula_core::{FieldId, RecordId, TableId};
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(60);

    fn create_test_provider() -> (LmdbCacheProvider, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let provider =
            LmdbCacheProvider::new(temp_dir.path(), 10).expect("provider creation should succeed");
        (provider, temp_dir)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (provider, _temp_dir) = create_test_provider();
        let key = CacheKey::field_by_id(&FieldId::new("f1"));

        provider
            .set(&key, b"{\"a\":1}".to_vec(), TTL)
            .await
            .expect("set should succeed");
        let value = provider.get(&key).await.expect("get should succeed");
        assert_eq!(value.as_deref(), Some(&b"{\"a\":1}"[..]));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (provider, _temp_dir) = create_test_provider();
        let key = CacheKey::field_by_id(&FieldId::new("missing"));
        assert!(provider.get(&key).await.expect("get should succeed").is_none());
        assert_eq!(provider.stats().await.unwrap().misses, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_removed_on_read() {
        let (provider, _temp_dir) = create_test_provider();
        let key = CacheKey::field_by_id(&FieldId::new("f1"));

        provider
            .set(&key, vec![1, 2, 3], Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(provider.get(&key).await.unwrap().is_none());
        assert_eq!(provider.stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_invalidate_pattern_scans_keys() {
        let (provider, _temp_dir) = create_test_provider();
        let t1 = TableId::new("t1");
        let r1 = RecordId::new("r1");

        for key in [
            CacheKey::record_by_id(&t1, &r1),
            CacheKey::record_by_id(&TableId::new("t2"), &r1),
            CacheKey::record_by_id(&t1, &RecordId::new("r2")),
        ] {
            provider.set(&key, vec![0], TTL).await.unwrap();
        }

        let removed = provider
            .invalidate_pattern(&InvalidationPattern::record_any_parent(&r1))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(provider.stats().await.unwrap().entry_count, 1);
    }

    #[tokio::test]
    async fn test_delete_keys() {
        let (provider, _temp_dir) = create_test_provider();
        let key = CacheKey::fields_by_table(&TableId::new("t1"));
        provider.set(&key, vec![0], TTL).await.unwrap();

        provider.delete(&[key.clone()]).await.unwrap();
        assert!(provider.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let key = CacheKey::field_by_id(&FieldId::new("f1"));
        {
            let provider = LmdbCacheProvider::new(temp_dir.path(), 10).unwrap();
            provider.set(&key, vec![7], TTL).await.unwrap();
        }
        let provider = LmdbCacheProvider::new(temp_dir.path(), 10).unwrap();
        assert_eq!(provider.get(&key).await.unwrap(), Some(vec![7]));
    }

    #[test]
    fn test_from_config_requires_path() {
        let config = StorageConfig::default();
        assert!(matches!(
            LmdbCacheProvider::from_config(&config),
            Err(LmdbCacheError::NotConfigured)
        ));

        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            lmdb_path: Some(PathBuf::from(temp_dir.path())),
            lmdb_max_size_mb: 10,
            ..Default::default()
        };
        assert!(LmdbCacheProvider::from_config(&config).is_ok());
    }

    #[test]
    fn test_oversized_map_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            LmdbCacheProvider::new(temp_dir.path(), usize::MAX),
            Err(LmdbCacheError::EnvOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_huge_ttl_is_saturated() {
        let (provider, _temp_dir) = create_test_provider();
        let key = CacheKey::field_by_id(&FieldId::new("f1"));
        provider
            .set(&key, vec![1], Duration::from_secs(u64::MAX))
            .await
            .unwrap();
        assert_eq!(provider.get(&key).await.unwrap(), Some(vec![1]));
    }

    #[test]
    fn test_decode_rejects_short_values() {
        assert!(decode_value(&[1, 2, 3]).is_none());
        let encoded = encode_value(b"x", TTL);
        let (expires_at, payload) = decode_value(&encoded).unwrap();
        assert!(expires_at > now_millis());
        assert_eq!(payload, b"x");
    }
}
