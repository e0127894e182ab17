//! Configuration for the cache and live layers.
//!
//! Configuration is loaded from environment variables with defaults suitable
//! for development.

use std::path::PathBuf;
use std::time::Duration;

use crate::collection::DEFAULT_COLLECTION_PREFIX;
use crate::error::ConfigError;

/// Default TTL for field metadata (rarely mutated).
pub const DEFAULT_FIELD_TTL: Duration = Duration::from_secs(5 * 60);

/// Default TTL for record point reads and collection reads.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(2 * 60);

/// Default TTL for paged record listings (frequently invalidated).
pub const DEFAULT_RECORD_LIST_TTL: Duration = Duration::from_secs(30);

/// Longest TTL any cache class accepts.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default bound on the repository unwrap chain.
pub const DEFAULT_MAX_UNWRAP_DEPTH: usize = 8;

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue {
                field: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

// ============================================================================
// CACHE TTL CONFIGURATION
// ============================================================================

/// TTL classes of the cache-consistent repositories.
///
/// Reads issued inside a write transaction are never cached, so they have no
/// TTL class here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTtlConfig {
    /// Field metadata, point and per-table reads.
    pub field_ttl: Duration,
    /// Record point reads and per-table collection reads.
    pub record_ttl: Duration,
    /// Paged record listings. Never longer than `record_ttl`.
    pub record_list_ttl: Duration,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            field_ttl: DEFAULT_FIELD_TTL,
            record_ttl: DEFAULT_RECORD_TTL,
            record_list_ttl: DEFAULT_RECORD_LIST_TTL,
        }
    }
}

impl CacheTtlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_ttl(mut self, ttl: Duration) -> Self {
        self.field_ttl = ttl;
        self
    }

    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = ttl;
        self
    }

    pub fn with_record_list_ttl(mut self, ttl: Duration) -> Self {
        self.record_list_ttl = ttl;
        self
    }

    /// TTL actually applied to paged listings.
    pub fn effective_record_list_ttl(&self) -> Duration {
        self.record_list_ttl.min(self.record_ttl)
    }

    /// Load from environment variables.
    ///
    /// - `TABULA_FIELD_CACHE_TTL_SECS` (default: 300)
    /// - `TABULA_RECORD_CACHE_TTL_SECS` (default: 120)
    /// - `TABULA_RECORD_LIST_CACHE_TTL_SECS` (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self {
            field_ttl: parse_secs(&lookup, "TABULA_FIELD_CACHE_TTL_SECS", DEFAULT_FIELD_TTL)?,
            record_ttl: parse_secs(&lookup, "TABULA_RECORD_CACHE_TTL_SECS", DEFAULT_RECORD_TTL)?,
            record_list_ttl: parse_secs(
                &lookup,
                "TABULA_RECORD_LIST_CACHE_TTL_SECS",
                DEFAULT_RECORD_LIST_TTL,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject zero TTLs and TTLs above [`MAX_CACHE_TTL`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, ttl) in [
            ("field_ttl", self.field_ttl),
            ("record_ttl", self.record_ttl),
            ("record_list_ttl", self.record_list_ttl),
        ] {
            if ttl.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: "0".to_string(),
                    reason: "TTL must be greater than zero".to_string(),
                });
            }
            if ttl > MAX_CACHE_TTL {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: ttl.as_secs().to_string(),
                    reason: format!("TTL must not exceed {} seconds", MAX_CACHE_TTL.as_secs()),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// LIVE CONFIGURATION
// ============================================================================

/// Settings of the subscription registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveConfig {
    /// Prefix prepended to the table id to form the collection key.
    pub collection_prefix: String,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            collection_prefix: DEFAULT_COLLECTION_PREFIX.to_string(),
        }
    }
}

impl LiveConfig {
    /// Load from environment variables.
    ///
    /// - `TABULA_COLLECTION_PREFIX` (default: "rec_")
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let collection_prefix = lookup("TABULA_COLLECTION_PREFIX")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_COLLECTION_PREFIX.to_string());
        Self { collection_prefix }
    }
}

// ============================================================================
// STORAGE CONFIGURATION
// ============================================================================

/// Settings of the storage layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory of the LMDB cache environment, if the LMDB provider is used.
    pub lmdb_path: Option<PathBuf>,
    /// Maximum LMDB map size in megabytes.
    pub lmdb_max_size_mb: usize,
    /// Bound on the repository unwrap chain when resolving capabilities.
    pub max_unwrap_depth: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lmdb_path: None,
            lmdb_max_size_mb: 256,
            max_unwrap_depth: DEFAULT_MAX_UNWRAP_DEPTH,
        }
    }
}

impl StorageConfig {
    /// Load from environment variables.
    ///
    /// - `TABULA_LMDB_PATH` (default: unset, in-memory cache)
    /// - `TABULA_LMDB_MAX_SIZE_MB` (default: 256)
    /// - `TABULA_MAX_UNWRAP_DEPTH` (default: 8)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let parse_usize = |key: &str, default: usize| -> Result<usize, ConfigError> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    field: key.to_string(),
                    value: raw.clone(),
                    reason: "expected a positive integer".to_string(),
                }),
            }
        };

        let max_unwrap_depth =
            parse_usize("TABULA_MAX_UNWRAP_DEPTH", defaults.max_unwrap_depth)?;
        if max_unwrap_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "TABULA_MAX_UNWRAP_DEPTH".to_string(),
                value: "0".to_string(),
                reason: "depth must be at least 1".to_string(),
            });
        }

        Ok(Self {
            lmdb_path: lookup("TABULA_LMDB_PATH")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            lmdb_max_size_mb: parse_usize("TABULA_LMDB_MAX_SIZE_MB", defaults.lmdb_max_size_mb)?,
            max_unwrap_depth,
        })
    }
}
