//! Document Sync Primitive Contract
//!
//! The registry does not implement operational transform or networking. It
//! drives an external sync primitive through the traits below:
//!
//! - [`SyncConnection`] hands out one [`DocumentHandle`] per
//!   `(collection, record)` pair.
//! - A handle loads the document on `subscribe`, accepts patch submissions,
//!   and reports load, operation and error notifications to every attached
//!   [`DocumentObserver`].
//!
//! Implementations must notify observers of one document sequentially and
//! in the order the changes were applied.

use std::sync::Arc;

use async_trait::async_trait;
use tabula_core::{CollectionKey, LiveError, PatchEntry, RecordId, RecordSnapshot};
use thiserror::Error;

/// Failure reported by the sync transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection to the sync server is down")]
    Disconnected,

    #[error("document {record_id} was destroyed")]
    Destroyed { record_id: RecordId },

    #[error("sync server rejected the request: {reason}")]
    Rejected { reason: String },

    #[error("transport failure: {0}")]
    Other(String),
}

impl From<TransportError> for LiveError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => LiveError::NotConnected,
            other => LiveError::Transport {
                reason: other.to_string(),
            },
        }
    }
}

/// Why a submitted patch was not applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The old value carried by an entry did not match the live document.
    #[error("old value check failed: {reason}")]
    Conflict { reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Notification emitted by a document handle.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    /// Initial document contents are available.
    Load,
    /// A patch was applied. `local` is set when it was submitted through the
    /// handle receiving the notification.
    Op { entries: Vec<PatchEntry>, local: bool },
    /// The transport failed for this document. The subscription stays open.
    Error(TransportError),
}

impl DocumentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Op { .. } => "op",
            Self::Error(_) => "error",
        }
    }
}

/// Receiver of document notifications.
///
/// `data` is the document contents after the event, `None` while the
/// document does not exist or could not be read.
pub trait DocumentObserver: Send + Sync {
    fn on_event(&self, event: DocumentEvent, data: Option<RecordSnapshot>);
}

/// Live handle on one record document.
#[async_trait]
pub trait DocumentHandle: Send + Sync {
    fn record_id(&self) -> &RecordId;

    /// Register an observer for every later notification.
    fn attach(&self, observer: Arc<dyn DocumentObserver>);

    /// Start receiving changes. Resolves once the initial load finished.
    async fn subscribe(&self) -> Result<(), TransportError>;

    /// Submit entries to be applied atomically with old-value checks.
    async fn submit_op(&self, entries: Vec<PatchEntry>) -> Result<(), SubmitError>;

    /// Current contents, `None` until loaded or when the document is absent.
    fn data(&self) -> Option<RecordSnapshot>;

    /// Stop receiving changes and drop every attached observer.
    fn destroy(&self);
}

/// Connection to the sync server.
#[async_trait]
pub trait SyncConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Open a handle on `record_id` inside `collection`. Each call yields a
    /// fresh handle.
    async fn get_document(
        &self,
        collection: &CollectionKey,
        record_id: &RecordId,
    ) -> Result<Arc<dyn DocumentHandle>, TransportError>;

    /// Release the connection. Later calls fail with `Disconnected`.
    async fn close(&self);
}
