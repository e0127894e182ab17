//! Tabula Live - Record Subscription Multiplexer
//!
//! Lets many listeners observe the same record through a single document
//! handle of an external sync primitive, and turns field edits into minimal
//! patch operations carrying old-value conflict checks.
//!
//! ## Layout
//!
//! - [`transport`]: the contract the sync primitive implements
//! - [`adapter`]: per-subscription translation of document notifications
//!   into [`RecordEvent`]s
//! - [`registry`]: the [`SubscriptionRegistry`] itself
//! - [`memory`]: an in-process sync primitive

pub mod adapter;
pub mod event;
pub mod memory;
pub mod registry;
pub mod sink;
pub mod transport;

pub use adapter::EventAdapter;
pub use event::{ListenerId, RecordEvent, RecordEventKind, RecordListener};
pub use memory::{InMemoryConnection, InMemoryDocumentHandle, InMemorySyncServer};
pub use registry::{SubscriptionRegistry, SubscriptionState};
pub use sink::{ErrorSink, TracingErrorSink};
pub use transport::{
    DocumentEvent, DocumentHandle, DocumentObserver, SubmitError, SyncConnection, TransportError,
};
