//! In-memory document sync primitive.
//!
//! A single-process stand-in for the sync server: documents live in a
//! [`InMemorySyncServer`], clients talk to it through
//! [`InMemoryConnection`]s. Patches are applied with the same old-value
//! checks [`RecordSnapshot::apply`] performs, and every applied patch is
//! fanned out to all subscribed handles of the document, flagged local for
//! the handle that submitted it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tabula_core::{CollectionKey, PatchEntry, PatchError, RecordId, RecordSnapshot};
use tracing::debug;

use crate::transport::{
    DocumentEvent, DocumentHandle, DocumentObserver, SubmitError, SyncConnection, TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type DocumentKey = (CollectionKey, RecordId);

#[derive(Default)]
struct ServerDocument {
    data: Mutex<Option<RecordSnapshot>>,
    /// Held while applying and fanning out, so handles see one order.
    delivery: Mutex<()>,
    handles: Mutex<Vec<Weak<InMemoryDocumentHandle>>>,
}

impl ServerDocument {
    fn subscribed_handles(&self) -> Vec<Arc<InMemoryDocumentHandle>> {
        let mut handles = lock(&self.handles);
        handles.retain(|h| h.strong_count() > 0);
        handles.iter().filter_map(Weak::upgrade).collect()
    }
}

// ============================================================================
// SERVER
// ============================================================================

/// Authoritative document store shared by every in-memory connection.
#[derive(Default)]
pub struct InMemorySyncServer {
    documents: DashMap<DocumentKey, Arc<ServerDocument>>,
    next_handle: AtomicU64,
    applied: AtomicUsize,
}

impl InMemorySyncServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn document_entry(&self, collection: &CollectionKey, record_id: &RecordId) -> Arc<ServerDocument> {
        Arc::clone(
            self.documents
                .entry((collection.clone(), record_id.clone()))
                .or_default()
                .value(),
        )
    }

    /// Create or overwrite a document without notifying anyone.
    pub fn seed(&self, collection: &CollectionKey, record_id: &RecordId, data: RecordSnapshot) {
        let document = self.document_entry(collection, record_id);
        *lock(&document.data) = Some(data);
    }

    /// Current contents of a document.
    pub fn document(&self, collection: &CollectionKey, record_id: &RecordId) -> Option<RecordSnapshot> {
        self.documents
            .get(&(collection.clone(), record_id.clone()))
            .and_then(|doc| lock(&doc.data).clone())
    }

    /// Patches applied so far, across all documents.
    pub fn applied_count(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    /// Open a new client connection.
    pub fn connect(self: &Arc<Self>) -> Arc<InMemoryConnection> {
        Arc::new(InMemoryConnection {
            server: Arc::clone(self),
            connected: Arc::new(AtomicBool::new(true)),
            handles: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            load_delay: Mutex::new(None),
            documents_opened: AtomicUsize::new(0),
            submits: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Apply a patch coming from a writer outside any connection. Every
    /// subscribed handle sees it as remote.
    pub fn apply_remote(
        &self,
        collection: &CollectionKey,
        record_id: &RecordId,
        entries: Vec<PatchEntry>,
    ) -> Result<(), SubmitError> {
        let document = self.document_entry(collection, record_id);
        self.apply(&document, record_id, entries, None)
    }

    fn apply(
        &self,
        document: &ServerDocument,
        record_id: &RecordId,
        entries: Vec<PatchEntry>,
        origin: Option<u64>,
    ) -> Result<(), SubmitError> {
        let _order = lock(&document.delivery);
        let data = {
            let mut current = lock(&document.data);
            let mut next = current.clone().unwrap_or_default();
            next.apply(&entries).map_err(|e| match e {
                PatchError::Conflict { .. } => SubmitError::Conflict {
                    reason: e.to_string(),
                },
                other => SubmitError::Transport(TransportError::Rejected {
                    reason: other.to_string(),
                }),
            })?;
            *current = Some(next.clone());
            next
        };
        self.applied.fetch_add(1, Ordering::SeqCst);
        debug!(record_id = %record_id, entries = entries.len(), "Patch applied");

        for handle in document.subscribed_handles() {
            let local = origin == Some(handle.id);
            handle.dispatch(
                DocumentEvent::Op {
                    entries: entries.clone(),
                    local,
                },
                Some(data.clone()),
            );
        }
        Ok(())
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

/// Client connection to an [`InMemorySyncServer`].
pub struct InMemoryConnection {
    server: Arc<InMemorySyncServer>,
    connected: Arc<AtomicBool>,
    handles: Mutex<Vec<Weak<InMemoryDocumentHandle>>>,
    rejected: Mutex<HashSet<RecordId>>,
    load_delay: Mutex<Option<Duration>>,
    documents_opened: AtomicUsize,
    submits: Arc<AtomicUsize>,
}

impl InMemoryConnection {
    pub fn server(&self) -> &Arc<InMemorySyncServer> {
        &self.server
    }

    /// Drop the link. Handles stay alive but every call fails.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Make `get_document` for `record_id` fail with a rejection.
    pub fn reject_record(&self, record_id: RecordId) {
        lock(&self.rejected).insert(record_id);
    }

    /// Delay every initial load by `delay`.
    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *lock(&self.load_delay) = delay;
    }

    /// Deliver a transport error to every live handle on `record_id`.
    /// Returns how many handles were notified.
    pub fn inject_error(&self, record_id: &RecordId, error: TransportError) -> usize {
        let targets: Vec<_> = self
            .live_handles()
            .into_iter()
            .filter(|h| &h.record_id == record_id)
            .collect();
        for handle in &targets {
            let _order = lock(&handle.document.delivery);
            handle.dispatch(DocumentEvent::Error(error.clone()), handle.data());
        }
        targets.len()
    }

    /// Handles ever handed out by `get_document`.
    pub fn documents_opened(&self) -> usize {
        self.documents_opened.load(Ordering::SeqCst)
    }

    /// Handles not yet destroyed.
    pub fn open_handles(&self) -> usize {
        self.live_handles().len()
    }

    /// Handles still allocated, destroyed or not. Drops to zero once every
    /// caller has released its handles.
    pub fn retained_handles(&self) -> usize {
        let mut handles = lock(&self.handles);
        handles.retain(|h| h.strong_count() > 0);
        handles.len()
    }

    fn live_handles(&self) -> Vec<Arc<InMemoryDocumentHandle>> {
        let mut handles = lock(&self.handles);
        handles.retain(|h| h.strong_count() > 0);
        handles
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|h| !h.is_destroyed())
            .collect()
    }

    /// Patches submitted through this connection, applied or not.
    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncConnection for InMemoryConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_document(
        &self,
        collection: &CollectionKey,
        record_id: &RecordId,
    ) -> Result<Arc<dyn DocumentHandle>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        if lock(&self.rejected).contains(record_id) {
            return Err(TransportError::Rejected {
                reason: format!("document {} is not readable", record_id),
            });
        }

        let document = self.server.document_entry(collection, record_id);
        let handle = Arc::new(InMemoryDocumentHandle {
            id: self.server.next_handle.fetch_add(1, Ordering::SeqCst),
            record_id: record_id.clone(),
            server: Arc::clone(&self.server),
            document: Arc::clone(&document),
            connected: Arc::clone(&self.connected),
            load_delay: *lock(&self.load_delay),
            observers: Mutex::new(Vec::new()),
            subscribed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            submits: Arc::clone(&self.submits),
        });
        lock(&document.handles).push(Arc::downgrade(&handle));
        {
            let mut handles = lock(&self.handles);
            handles.retain(|h| h.strong_count() > 0);
            handles.push(Arc::downgrade(&handle));
        }
        self.documents_opened.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn close(&self) {
        self.disconnect();
        debug!(
            documents_opened = self.documents_opened(),
            submits = self.submit_count(),
            "In-memory connection closed"
        );
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Handle on one document, created by [`InMemoryConnection::get_document`].
pub struct InMemoryDocumentHandle {
    id: u64,
    record_id: RecordId,
    server: Arc<InMemorySyncServer>,
    document: Arc<ServerDocument>,
    connected: Arc<AtomicBool>,
    load_delay: Option<Duration>,
    observers: Mutex<Vec<Arc<dyn DocumentObserver>>>,
    subscribed: AtomicBool,
    destroyed: AtomicBool,
    submits: Arc<AtomicUsize>,
}

impl InMemoryDocumentHandle {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn dispatch(&self, event: DocumentEvent, data: Option<RecordSnapshot>) {
        if self.is_destroyed() || !self.subscribed.load(Ordering::SeqCst) {
            return;
        }
        let observers = lock(&self.observers).clone();
        for observer in observers {
            observer.on_event(event.clone(), data.clone());
        }
    }
}

#[async_trait]
impl DocumentHandle for InMemoryDocumentHandle {
    fn record_id(&self) -> &RecordId {
        &self.record_id
    }

    fn attach(&self, observer: Arc<dyn DocumentObserver>) {
        lock(&self.observers).push(observer);
    }

    async fn subscribe(&self) -> Result<(), TransportError> {
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        if self.is_destroyed() {
            return Err(TransportError::Destroyed {
                record_id: self.record_id.clone(),
            });
        }

        let _order = lock(&self.document.delivery);
        self.subscribed.store(true, Ordering::SeqCst);
        self.dispatch(DocumentEvent::Load, self.data());
        Ok(())
    }

    async fn submit_op(&self, entries: Vec<PatchEntry>) -> Result<(), SubmitError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected.into());
        }
        if self.is_destroyed() {
            return Err(TransportError::Destroyed {
                record_id: self.record_id.clone(),
            }
            .into());
        }
        self.server
            .apply(&self.document, &self.record_id, entries, Some(self.id))
    }

    fn data(&self) -> Option<RecordSnapshot> {
        if !self.subscribed.load(Ordering::SeqCst) {
            return None;
        }
        lock(&self.document.data).clone()
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        lock(&self.observers).clear();
    }
}
