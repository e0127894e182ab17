//! Error types for tabula operations
//!
//! Only fatal kinds live here. Cache failures and transport errors on a live
//! subscription are recovered where they happen and never become a
//! [`TabulaError`].

use crate::{EntityKind, RecordId, TransactionId};
use thiserror::Error;

/// Storage layer errors raised by authoritative repositories.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_kind:?} with id {id}")]
    NotFound { entity_kind: EntityKind, id: String },

    #[error("Entity already exists: {entity_kind:?} with id {id}")]
    AlreadyExists { entity_kind: EntityKind, id: String },

    #[error("Transaction not found: {transaction_id}")]
    TransactionNotFound { transaction_id: TransactionId },

    #[error("Capability unavailable: {capability}")]
    CapabilityUnavailable { capability: String },

    #[error("Repository unwrap chain exceeded depth {depth}")]
    UnwrapDepthExceeded { depth: usize },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Storage backend error: {reason}")]
    Backend { reason: String },
}

/// Errors surfaced by the live subscription layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LiveError {
    #[error("Sync transport is not connected")]
    NotConnected,

    #[error("Record {record_id} has no live subscription")]
    NotSubscribed { record_id: RecordId },

    #[error("Optimistic conflict on record {record_id}: {reason}")]
    OptimisticConflict { record_id: RecordId, reason: String },

    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error("{failed} of {total} subscriptions failed, first error: {first}")]
    SubscribeBatchFailed {
        failed: usize,
        total: usize,
        first: String,
    },
}

impl LiveError {
    /// Conflicts are the only live errors a caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OptimisticConflict { .. })
    }
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid {kind} '{value}': {reason}")]
    InvalidIdentifier {
        kind: String,
        value: String,
        reason: String,
    },

    #[error("Invalid patch path {path:?}: {reason}")]
    InvalidPath { path: Vec<String>, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Collection context not set: call set_table before subscribing")]
    CollectionNotSet,

    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to register metric {metric}: {reason}")]
    MetricsRegistration { metric: String, reason: String },
}

/// Master error type for all tabula errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TabulaError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Live error: {0}")]
    Live(#[from] LiveError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TabulaError {
    /// Returns true if the error is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Live(LiveError::OptimisticConflict { .. }))
    }
}

/// Result type alias for tabula operations.
pub type TabulaResult<T> = Result<T, TabulaError>;

// =============================================================================
// TESTS
// =============================================================================
