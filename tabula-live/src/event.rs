//! Events delivered to record listeners.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tabula_core::{Operation, RecordId, RecordSnapshot};
use tokio::sync::mpsc::UnboundedSender;

/// What produced a [`RecordEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordEventKind {
    /// Initial contents, sent once to every listener that joins.
    Snapshot,
    /// A patch applied to the document.
    Change,
    /// Best-effort snapshot sent in place of a transport error.
    Degraded,
}

impl RecordEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Change => "change",
            Self::Degraded => "degraded",
        }
    }
}

/// Uniform event shape every listener receives.
///
/// `data` always holds a usable snapshot: for degraded events it is the
/// last known data, or empty when nothing was ever loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEvent {
    pub kind: RecordEventKind,
    pub operations: Operation,
    pub is_local_origin: bool,
    pub data: RecordSnapshot,
}

impl RecordEvent {
    pub fn snapshot(record_id: &RecordId, data: RecordSnapshot) -> Self {
        Self {
            kind: RecordEventKind::Snapshot,
            operations: Operation::empty(record_id.clone()),
            is_local_origin: false,
            data,
        }
    }

    pub fn change(operations: Operation, is_local_origin: bool, data: RecordSnapshot) -> Self {
        Self {
            kind: RecordEventKind::Change,
            operations,
            is_local_origin,
            data,
        }
    }

    pub fn degraded(record_id: &RecordId, data: RecordSnapshot) -> Self {
        Self {
            kind: RecordEventKind::Degraded,
            operations: Operation::empty(record_id.clone()),
            is_local_origin: false,
            data,
        }
    }

    pub fn record_id(&self) -> &RecordId {
        &self.operations.record_id
    }
}

/// Callback invoked synchronously on the delivering path.
///
/// Implementations must return promptly; the registry enforces no timeout.
pub trait RecordListener: Send + Sync {
    fn on_event(&self, event: &RecordEvent);
}

impl<F> RecordListener for F
where
    F: Fn(&RecordEvent) + Send + Sync,
{
    fn on_event(&self, event: &RecordEvent) {
        self(event)
    }
}

/// Forwards events into a channel. A closed receiver drops them silently.
impl RecordListener for UnboundedSender<RecordEvent> {
    fn on_event(&self, event: &RecordEvent) {
        let _ = self.send(event.clone());
    }
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Registration token returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}
