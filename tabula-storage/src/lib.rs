//! Tabula Storage - Repository Contracts and Cache Consistency
//!
//! Defines the authoritative repository contracts for fields and records,
//! the transaction capability and its unwrap chain, an in-memory
//! authoritative store, and the cache-consistent wrappers that sit in front
//! of any store.

pub mod cache;
pub mod capability;
pub mod memory;
pub mod repository;

pub use cache::{
    CacheError, CacheKey, CacheProvider, CacheStats, CachedFieldRepository,
    CachedRecordRepository, InMemoryCacheProvider, InvalidationPattern, LmdbCacheError,
    LmdbCacheProvider,
};
pub use capability::{layer_chain, resolve_transaction_source, RepositoryLayer, TransactionSource};
pub use memory::{InMemoryFieldRepository, InMemoryRecordRepository, TransactionManager};
pub use repository::{FieldFilter, FieldRepository, RecordFilter, RecordPage, RecordRepository};
