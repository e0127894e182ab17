//! Tabula Core - Entity Types and Patch Operations
//!
//! Pure data structures and pure functions shared by the storage and live
//! crates: identifiers, entities, field patch operations, the store call
//! context, configuration and the error taxonomy. No I/O happens here.

pub mod collection;
pub mod config;
pub mod context;
pub mod entities;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod operation;

pub use collection::{CollectionKey, DEFAULT_COLLECTION_PREFIX};
pub use config::{
    CacheTtlConfig, LiveConfig, StorageConfig, DEFAULT_FIELD_TTL, DEFAULT_MAX_UNWRAP_DEPTH,
    DEFAULT_RECORD_LIST_TTL, DEFAULT_RECORD_TTL, MAX_CACHE_TTL,
};
pub use context::StoreContext;
pub use entities::{EntityKind, Field, FieldType, Record, RecordVersion};
pub use error::{
    ConfigError, LiveError, StorageError, TabulaError, TabulaResult, ValidationError,
};
pub use ids::{FieldId, RecordId, TableId, Timestamp, TransactionId};
pub use metrics::{gather_metrics, metrics, CacheOutcome, TabulaMetrics, METRICS};
pub use operation::{
    build_field_update, OpPath, Operation, PatchEntry, PatchError, PatchKind, RecordSnapshot,
    FIELD_DATA_NAMESPACE,
};
