//! Cache layer in front of the authoritative repositories.
//!
//! # Consistency Model
//!
//! Reads are cache-aside: the cache is consulted first, the wrapped
//! repository on a miss, and the cache is populated afterwards. Writes go to
//! the wrapped repository first and invalidate only once it succeeded.
//!
//! Reads issued inside a write transaction never touch the cache. The
//! transaction may see rows other readers cannot see yet, or may roll back.
//!
//! A read racing a write can repopulate a value that is stale a moment
//! later, until the writer's invalidation lands or the entry expires. That
//! window is accepted: the cache has no transactions to close it with.
//!
//! Provider failures never reach callers. They are logged, counted in
//! `tabula_cache_reads_total{outcome="degraded"}` and served from the store.

pub mod aside;
pub mod cached_field;
pub mod cached_record;
pub mod key;
pub mod lmdb_backend;
pub mod memory;
pub mod provider;

pub use aside::{CacheAside, ReadKind};
pub use cached_field::CachedFieldRepository;
pub use cached_record::CachedRecordRepository;
pub use key::{CacheKey, InvalidationPattern};
pub use lmdb_backend::{LmdbCacheError, LmdbCacheProvider};
pub use memory::InMemoryCacheProvider;
pub use provider::{CacheError, CacheProvider, CacheStats};
