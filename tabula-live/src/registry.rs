//! Subscription Registry
//!
//! Multiplexes listeners onto at most one live document handle per record.
//!
//! ## Concurrency
//!
//! - Records are kept in a `DashMap` of slots, so work on different records
//!   runs in parallel.
//! - Each slot owns an async mutex serializing subscribe, unsubscribe and
//!   listener removal on that record.
//! - A slot is removed from the map under its own lock. Callers that locked
//!   a slot which was removed meanwhile retry against the current one.
//!
//! ## Lifecycle
//!
//! `Unsubscribed -> Subscribing -> Active -> Unsubscribed`. A subscribe that
//! fails or is cancelled while `Subscribing` destroys whatever handle it had
//! acquired and returns the record to `Unsubscribed`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::Value;
use tabula_core::{
    build_field_update, metrics, CollectionKey, ConfigError, FieldId, LiveConfig, LiveError,
    Operation, RecordId, RecordSnapshot, StorageError, TableId, TabulaResult,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapter::EventAdapter;
use crate::event::{ListenerId, RecordListener};
use crate::sink::{ErrorSink, TracingErrorSink};
use crate::transport::{DocumentHandle, SubmitError, SyncConnection};

/// Lifecycle state of one record's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active,
}

impl SubscriptionState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Unsubscribed => 0,
            Self::Subscribing => 1,
            Self::Active => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Subscribing,
            2 => Self::Active,
            _ => Self::Unsubscribed,
        }
    }
}

struct Subscription {
    handle: Arc<dyn DocumentHandle>,
    adapter: Arc<EventAdapter>,
}

impl Subscription {
    fn tear_down(self) {
        self.adapter.clear();
        self.handle.destroy();
        if let Some(m) = metrics() {
            m.live_subscriptions.dec();
        }
    }
}

struct Slot {
    state: AtomicU8,
    inner: Mutex<Option<Subscription>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SubscriptionState::Unsubscribed.to_u8()),
            inner: Mutex::new(None),
        }
    }

    fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SubscriptionState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }
}

/// Rolls back a subscribe that did not reach `Active`.
struct PendingSubscribe<'a> {
    slots: &'a DashMap<RecordId, Arc<Slot>>,
    record_id: &'a RecordId,
    slot: &'a Arc<Slot>,
    handle: Option<Arc<dyn DocumentHandle>>,
    armed: bool,
}

impl PendingSubscribe<'_> {
    fn complete(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingSubscribe<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(handle) = self.handle.take() {
            handle.destroy();
        }
        self.slot.set_state(SubscriptionState::Unsubscribed);
        self.slots
            .remove_if(self.record_id, |_, current| Arc::ptr_eq(current, self.slot));
        debug!(record_id = %self.record_id, "Pending subscribe rolled back");
    }
}

/// Owned registry of live record subscriptions.
pub struct SubscriptionRegistry {
    config: LiveConfig,
    sink: Arc<dyn ErrorSink>,
    connection: RwLock<Option<Arc<dyn SyncConnection>>>,
    table: RwLock<Option<TableId>>,
    slots: DashMap<RecordId, Arc<Slot>>,
}

impl SubscriptionRegistry {
    pub fn new(config: LiveConfig) -> Self {
        Self {
            config,
            sink: Arc::new(TracingErrorSink),
            connection: RwLock::new(None),
            table: RwLock::new(None),
            slots: DashMap::new(),
        }
    }

    /// Replace the sink receiving recovered transport errors.
    pub fn with_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    /// Use `connection` for every later subscription.
    pub fn connect(&self, connection: Arc<dyn SyncConnection>) -> TabulaResult<()> {
        *self
            .connection
            .write()
            .map_err(|_| StorageError::LockPoisoned)? = Some(connection);
        info!("Live registry connected");
        Ok(())
    }

    /// Route subscriptions to the collection of `table_id`.
    pub fn set_table(&self, table_id: TableId) -> TabulaResult<()> {
        debug!(table_id = %table_id, "Live registry table set");
        *self.table.write().map_err(|_| StorageError::LockPoisoned)? = Some(table_id);
        Ok(())
    }

    /// Collection key of the current table.
    pub fn collection_key(&self) -> TabulaResult<CollectionKey> {
        let table = self.table.read().map_err(|_| StorageError::LockPoisoned)?;
        let table_id = table.as_ref().ok_or(ConfigError::CollectionNotSet)?;
        Ok(CollectionKey::for_table(&self.config.collection_prefix, table_id))
    }

    fn connection(&self) -> TabulaResult<Arc<dyn SyncConnection>> {
        let connection = self
            .connection
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .clone()
            .ok_or(LiveError::NotConnected)?;
        if !connection.is_connected() {
            return Err(LiveError::NotConnected.into());
        }
        Ok(connection)
    }

    fn slot(&self, record_id: &RecordId) -> Arc<Slot> {
        Arc::clone(
            self.slots
                .entry(record_id.clone())
                .or_insert_with(|| Arc::new(Slot::new()))
                .value(),
        )
    }

    fn existing_slot(&self, record_id: &RecordId) -> Option<Arc<Slot>> {
        self.slots.get(record_id).map(|s| Arc::clone(s.value()))
    }

    fn is_current(&self, record_id: &RecordId, slot: &Arc<Slot>) -> bool {
        self.slots
            .get(record_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    /// Subscribe `listener` to `record_id`.
    ///
    /// The first subscriber acquires the document handle and waits for the
    /// initial load. Later subscribers share it. In both cases `listener`
    /// receives the current snapshot, if there is one, before this returns.
    pub async fn subscribe(
        &self,
        record_id: &RecordId,
        listener: Arc<dyn RecordListener>,
    ) -> TabulaResult<ListenerId> {
        let collection = self.collection_key()?;
        let connection = self.connection()?;

        loop {
            let slot = self.slot(record_id);
            let mut guard = slot.inner.lock().await;
            if !self.is_current(record_id, &slot) {
                continue;
            }

            let listener_id = ListenerId::next();
            if let Some(subscription) = guard.as_ref() {
                subscription.adapter.prime(subscription.handle.data());
                subscription.adapter.add_listener(listener_id, listener);
                debug!(record_id = %record_id, listener_id = %listener_id, "Listener joined");
                return Ok(listener_id);
            }

            slot.set_state(SubscriptionState::Subscribing);
            let mut pending = PendingSubscribe {
                slots: &self.slots,
                record_id,
                slot: &slot,
                handle: None,
                armed: true,
            };

            let handle = connection
                .get_document(&collection, record_id)
                .await
                .map_err(LiveError::from)?;
            pending.handle = Some(Arc::clone(&handle));

            let adapter = Arc::new(EventAdapter::new(record_id.clone(), Arc::clone(&self.sink)));
            handle.attach(adapter.clone());
            handle.subscribe().await.map_err(LiveError::from)?;

            adapter.prime(handle.data());
            adapter.add_listener(listener_id, listener);
            *guard = Some(Subscription { handle, adapter });
            slot.set_state(SubscriptionState::Active);
            pending.complete();

            if let Some(m) = metrics() {
                m.live_subscriptions.inc();
            }
            info!(
                record_id = %record_id,
                collection = %collection,
                listener_id = %listener_id,
                "Record subscription active"
            );
            return Ok(listener_id);
        }
    }

    /// Subscribe `listener` to every id concurrently.
    ///
    /// Fails with [`LiveError::SubscribeBatchFailed`] if any subscribe
    /// failed. Subscriptions that succeeded stay active.
    pub async fn subscribe_many(
        &self,
        record_ids: &[RecordId],
        listener: Arc<dyn RecordListener>,
    ) -> TabulaResult<Vec<ListenerId>> {
        let results = join_all(
            record_ids
                .iter()
                .map(|id| self.subscribe(id, Arc::clone(&listener))),
        )
        .await;

        let total = results.len();
        let mut ids = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(id) => ids.push(id),
                Err(e) => failures.push(e),
            }
        }

        match failures.first() {
            None => Ok(ids),
            Some(first) => {
                warn!(
                    failed = failures.len(),
                    total,
                    error = %first,
                    "Batch subscribe partially failed"
                );
                Err(LiveError::SubscribeBatchFailed {
                    failed: failures.len(),
                    total,
                    first: first.to_string(),
                }
                .into())
            }
        }
    }

    /// Detach one listener. The subscription is torn down when the last
    /// listener leaves. Returns false if the listener was not registered.
    pub async fn remove_listener(&self, record_id: &RecordId, listener_id: ListenerId) -> bool {
        let Some(slot) = self.existing_slot(record_id) else {
            return false;
        };
        let mut guard = slot.inner.lock().await;
        if !self.is_current(record_id, &slot) {
            return false;
        }
        let Some(remaining) = guard
            .as_ref()
            .and_then(|s| s.adapter.remove_listener(listener_id))
        else {
            return false;
        };

        debug!(record_id = %record_id, listener_id = %listener_id, remaining, "Listener left");
        if remaining == 0 {
            if let Some(subscription) = guard.take() {
                self.retire(record_id, &slot, subscription);
            }
        }
        true
    }

    /// Tear the record's subscription down regardless of how many listeners
    /// it has. Returns false when there was nothing to tear down.
    pub async fn unsubscribe(&self, record_id: &RecordId) -> bool {
        let Some(slot) = self.existing_slot(record_id) else {
            return false;
        };
        let mut guard = slot.inner.lock().await;
        if !self.is_current(record_id, &slot) {
            return false;
        }
        match guard.take() {
            Some(subscription) => {
                self.retire(record_id, &slot, subscription);
                true
            }
            None => {
                self.slots
                    .remove_if(record_id, |_, current| Arc::ptr_eq(current, &slot));
                false
            }
        }
    }

    fn retire(&self, record_id: &RecordId, slot: &Arc<Slot>, subscription: Subscription) {
        subscription.tear_down();
        slot.set_state(SubscriptionState::Unsubscribed);
        self.slots
            .remove_if(record_id, |_, current| Arc::ptr_eq(current, slot));
        info!(record_id = %record_id, "Record subscription closed");
    }

    /// Tear every subscription down. Returns how many were closed.
    pub async fn unsubscribe_all(&self) -> usize {
        let ids: Vec<RecordId> = self.slots.iter().map(|e| e.key().clone()).collect();
        join_all(ids.iter().map(|id| self.unsubscribe(id)))
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count()
    }

    /// Submit a field change as a patch with old-value check.
    ///
    /// A change with neither a new nor an old value submits nothing.
    pub async fn submit_field_update(
        &self,
        record_id: &RecordId,
        field_id: &FieldId,
        new_value: Option<Value>,
        old_value: Option<Value>,
    ) -> TabulaResult<()> {
        self.connection()?;
        let operation = build_field_update(record_id, field_id, new_value, old_value);
        self.submit_operation(operation).await
    }

    /// Submit `operation` through the record's live handle.
    pub async fn submit_operation(&self, operation: Operation) -> TabulaResult<()> {
        self.connection()?;
        if operation.is_empty() {
            debug!(record_id = %operation.record_id, "Empty operation not submitted");
            return Ok(());
        }

        let record_id = operation.record_id.clone();
        let handle = self
            .active_handle(&record_id)
            .await
            .ok_or_else(|| LiveError::NotSubscribed {
                record_id: record_id.clone(),
            })?;

        handle
            .submit_op(operation.entries)
            .await
            .map_err(|e| match e {
                SubmitError::Conflict { reason } => {
                    debug!(record_id = %record_id, reason = %reason, "Operation rejected");
                    LiveError::OptimisticConflict { record_id, reason }
                }
                SubmitError::Transport(e) => LiveError::from(e),
            })?;
        Ok(())
    }

    async fn active_handle(&self, record_id: &RecordId) -> Option<Arc<dyn DocumentHandle>> {
        let slot = self.existing_slot(record_id)?;
        let guard = slot.inner.lock().await;
        guard.as_ref().map(|s| Arc::clone(&s.handle))
    }

    /// Last snapshot seen by the record's subscription.
    pub async fn snapshot(&self, record_id: &RecordId) -> Option<RecordSnapshot> {
        let slot = self.existing_slot(record_id)?;
        let guard = slot.inner.lock().await;
        guard.as_ref().and_then(|s| s.adapter.last_snapshot())
    }

    pub fn state(&self, record_id: &RecordId) -> SubscriptionState {
        self.slots
            .get(record_id)
            .map(|slot| slot.state())
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    /// Number of records with an active subscription.
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state() == SubscriptionState::Active)
            .count()
    }

    /// Tear down every subscription, then close the connection, then clear
    /// the table.
    pub async fn cleanup(&self) -> TabulaResult<()> {
        let closed = self.unsubscribe_all().await;

        let connection = self
            .connection
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .take();
        if let Some(connection) = connection {
            connection.close().await;
        }

        *self.table.write().map_err(|_| StorageError::LockPoisoned)? = None;
        info!(closed, "Live registry cleaned up");
        Ok(())
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(LiveConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_core::{ConfigError, TabulaError};

    fn noop() -> Arc<dyn RecordListener> {
        Arc::new(|_: &crate::event::RecordEvent| {})
    }

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            SubscriptionState::Unsubscribed,
            SubscriptionState::Subscribing,
            SubscriptionState::Active,
        ] {
            assert_eq!(SubscriptionState::from_u8(state.to_u8()), state);
        }
    }

    #[test]
    fn test_collection_key_requires_table() {
        let registry = SubscriptionRegistry::default();
        assert!(matches!(
            registry.collection_key(),
            Err(TabulaError::Config(ConfigError::CollectionNotSet))
        ));

        registry.set_table(TableId::new("t1")).unwrap();
        assert_eq!(registry.collection_key().unwrap().as_str(), "rec_t1");
    }

    #[test]
    fn test_collection_prefix_comes_from_config() {
        let registry = SubscriptionRegistry::new(LiveConfig {
            collection_prefix: "doc_".to_string(),
        });
        registry.set_table(TableId::new("t9")).unwrap();
        assert_eq!(registry.collection_key().unwrap().as_str(), "doc_t9");
    }

    #[tokio::test]
    async fn test_subscribe_without_table_fails_fast() {
        let registry = SubscriptionRegistry::default();
        let err = registry.subscribe(&RecordId::new("r1"), noop()).await.unwrap_err();
        assert!(matches!(err, TabulaError::Config(ConfigError::CollectionNotSet)));
    }

    #[tokio::test]
    async fn test_subscribe_without_connection_fails() {
        let registry = SubscriptionRegistry::default();
        registry.set_table(TableId::new("t1")).unwrap();
        let err = registry.subscribe(&RecordId::new("r1"), noop()).await.unwrap_err();
        assert_eq!(err, TabulaError::Live(LiveError::NotConnected));
        assert_eq!(registry.state(&RecordId::new("r1")), SubscriptionState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_record_is_noop() {
        let registry = SubscriptionRegistry::default();
        assert!(!registry.unsubscribe(&RecordId::new("r1")).await);
        assert_eq!(registry.unsubscribe_all().await, 0);
    }
}
