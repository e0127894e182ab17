//! In-memory authoritative repositories with transaction overlays.
//!
//! Each table keeps its committed rows plus one overlay per open
//! transaction. A read inside a transaction sees the committed rows with
//! that transaction's overlay applied; every other reader sees committed
//! rows only. Commit folds the overlay into the committed rows, rollback
//! drops it.
//!
//! Repositories built on the same [`TransactionManager`] share transactions,
//! so a single `begin` spans fields and records.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use chrono::Utc;
use tabula_core::{
    EntityKind, Field, FieldId, FieldType, Record, RecordId, RecordVersion, StorageError,
    StoreContext, TableId, TabulaResult, TransactionId,
};
use tracing::debug;

use crate::capability::{RepositoryLayer, TransactionSource};
use crate::repository::{FieldFilter, FieldRepository, RecordFilter, RecordPage, RecordRepository};

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// A table taking part in shared transactions.
trait TxParticipant: Send + Sync {
    fn commit(&self, tx: TransactionId) -> TabulaResult<()>;
    fn rollback(&self, tx: TransactionId) -> TabulaResult<()>;
}

/// Tracks open transactions and the tables they touch.
#[derive(Default)]
pub struct TransactionManager {
    open: Mutex<HashSet<TransactionId>>,
    participants: RwLock<Vec<Weak<dyn TxParticipant>>>,
}

impl TransactionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_open(&self, tx: TransactionId) -> bool {
        self.open
            .lock()
            .map(|open| open.contains(&tx))
            .unwrap_or(false)
    }

    /// Number of open transactions.
    pub fn open_count(&self) -> usize {
        self.open.lock().map(|open| open.len()).unwrap_or(0)
    }

    fn register(&self, participant: Weak<dyn TxParticipant>) -> TabulaResult<()> {
        self.participants
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .push(participant);
        Ok(())
    }

    /// The transaction of `ctx`, checked to be open.
    fn scope(&self, ctx: &StoreContext) -> TabulaResult<Option<TransactionId>> {
        match ctx.transaction_id() {
            None => Ok(None),
            Some(tx) if self.is_open(tx) => Ok(Some(tx)),
            Some(tx) => Err(StorageError::TransactionNotFound { transaction_id: tx }.into()),
        }
    }

    fn close(&self, ctx: &StoreContext) -> TabulaResult<TransactionId> {
        let tx = ctx.transaction_id().ok_or_else(|| StorageError::Backend {
            reason: "context carries no transaction".to_string(),
        })?;
        let removed = self
            .open
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .remove(&tx);
        if !removed {
            return Err(StorageError::TransactionNotFound { transaction_id: tx }.into());
        }
        Ok(tx)
    }

    fn live_participants(&self) -> TabulaResult<Vec<Arc<dyn TxParticipant>>> {
        let participants = self
            .participants
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(participants.iter().filter_map(Weak::upgrade).collect())
    }
}

#[async_trait]
impl TransactionSource for TransactionManager {
    async fn begin(&self) -> TabulaResult<StoreContext> {
        let tx = TransactionId::now_v7();
        self.open
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(tx);
        debug!(transaction_id = %tx, "transaction started");
        Ok(StoreContext::in_transaction(tx))
    }

    async fn commit(&self, ctx: &StoreContext) -> TabulaResult<()> {
        let tx = self.close(ctx)?;
        for participant in self.live_participants()? {
            participant.commit(tx)?;
        }
        debug!(transaction_id = %tx, "transaction committed");
        Ok(())
    }

    async fn rollback(&self, ctx: &StoreContext) -> TabulaResult<()> {
        let tx = self.close(ctx)?;
        for participant in self.live_participants()? {
            participant.rollback(tx)?;
        }
        debug!(transaction_id = %tx, "transaction rolled back");
        Ok(())
    }
}

// ============================================================================
// TRANSACTIONAL TABLE
// ============================================================================

struct TableState<K, V> {
    committed: BTreeMap<K, V>,
    /// Pending writes per transaction; `None` is a tombstone.
    overlays: BTreeMap<TransactionId, BTreeMap<K, Option<V>>>,
}

struct TxTable<K, V> {
    state: RwLock<TableState<K, V>>,
}

impl<K, V> TxTable<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn new() -> Self {
        Self {
            state: RwLock::new(TableState {
                committed: BTreeMap::new(),
                overlays: BTreeMap::new(),
            }),
        }
    }

    fn get(&self, tx: Option<TransactionId>, key: &K) -> TabulaResult<Option<V>> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(pending) = tx
            .and_then(|tx| state.overlays.get(&tx))
            .and_then(|overlay| overlay.get(key))
        {
            return Ok(pending.clone());
        }
        Ok(state.committed.get(key).cloned())
    }

    fn scan(&self, tx: Option<TransactionId>) -> TabulaResult<Vec<V>> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        let Some(overlay) = tx.and_then(|tx| state.overlays.get(&tx)) else {
            return Ok(state.committed.values().cloned().collect());
        };
        let mut merged = state.committed.clone();
        for (key, pending) in overlay {
            match pending {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    fn put(&self, tx: Option<TransactionId>, key: K, value: V) -> TabulaResult<()> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        match tx {
            Some(tx) => {
                state.overlays.entry(tx).or_default().insert(key, Some(value));
            }
            None => {
                state.committed.insert(key, value);
            }
        }
        Ok(())
    }

    fn remove(&self, tx: Option<TransactionId>, key: &K) -> TabulaResult<()> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        match tx {
            Some(tx) => {
                state
                    .overlays
                    .entry(tx)
                    .or_default()
                    .insert(key.clone(), None);
            }
            None => {
                state.committed.remove(key);
            }
        }
        Ok(())
    }
}

impl<K, V> TxParticipant for TxTable<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn commit(&self, tx: TransactionId) -> TabulaResult<()> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(overlay) = state.overlays.remove(&tx) {
            for (key, pending) in overlay {
                match pending {
                    Some(value) => {
                        state.committed.insert(key, value);
                    }
                    None => {
                        state.committed.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn rollback(&self, tx: TransactionId) -> TabulaResult<()> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        state.overlays.remove(&tx);
        Ok(())
    }
}

fn register_table<K, V>(
    manager: &TransactionManager,
    table: &Arc<TxTable<K, V>>,
) -> TabulaResult<()>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let participant: Arc<dyn TxParticipant> = table.clone();
    manager.register(Arc::downgrade(&participant))
}

fn paginate<T>(items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    let iter = items.into_iter().skip(offset);
    if limit == 0 {
        iter.collect()
    } else {
        iter.take(limit).collect()
    }
}

// ============================================================================
// FIELDS
// ============================================================================

/// In-memory field store.
pub struct InMemoryFieldRepository {
    manager: Arc<TransactionManager>,
    fields: Arc<TxTable<FieldId, Field>>,
}

impl InMemoryFieldRepository {
    /// A store with its own transaction manager.
    pub fn new() -> TabulaResult<Self> {
        Self::with_manager(TransactionManager::new())
    }

    /// A store sharing transactions with other stores of `manager`.
    pub fn with_manager(manager: Arc<TransactionManager>) -> TabulaResult<Self> {
        let fields = Arc::new(TxTable::new());
        register_table(&manager, &fields)?;
        Ok(Self { manager, fields })
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    fn table_fields(
        &self,
        tx: Option<TransactionId>,
        table_id: &TableId,
        predicate: impl Fn(&Field) -> bool,
    ) -> TabulaResult<Vec<Field>> {
        let mut fields: Vec<Field> = self
            .fields
            .scan(tx)?
            .into_iter()
            .filter(|f| &f.table_id == table_id && predicate(f))
            .collect();
        sort_fields(&mut fields);
        Ok(fields)
    }
}

fn sort_fields(fields: &mut [Field]) {
    fields.sort_by(|a, b| a.order.total_cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
}

fn field_not_found(id: &FieldId) -> StorageError {
    StorageError::NotFound {
        entity_kind: EntityKind::Field,
        id: id.to_string(),
    }
}

impl RepositoryLayer for InMemoryFieldRepository {
    fn layer_name(&self) -> &'static str {
        "in_memory_field"
    }

    fn transaction_source(&self) -> Option<&dyn TransactionSource> {
        Some(self.manager.as_ref())
    }
}

#[async_trait]
impl FieldRepository for InMemoryFieldRepository {
    async fn find_by_id(&self, ctx: &StoreContext, id: &FieldId) -> TabulaResult<Option<Field>> {
        let tx = self.manager.scope(ctx)?;
        self.fields.get(tx, id)
    }

    async fn find_by_table_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<Vec<Field>> {
        let tx = self.manager.scope(ctx)?;
        self.table_fields(tx, table_id, |_| true)
    }

    async fn find_by_name(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        name: &str,
    ) -> TabulaResult<Option<Field>> {
        let tx = self.manager.scope(ctx)?;
        Ok(self
            .table_fields(tx, table_id, |f| f.name == name)?
            .into_iter()
            .next())
    }

    async fn exists(&self, ctx: &StoreContext, id: &FieldId) -> TabulaResult<bool> {
        Ok(self.find_by_id(ctx, id).await?.is_some())
    }

    async fn exists_by_name(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        name: &str,
        exclude: Option<&FieldId>,
    ) -> TabulaResult<bool> {
        let tx = self.manager.scope(ctx)?;
        let matches = self.table_fields(tx, table_id, |f| {
            f.name == name && exclude.map_or(true, |ex| &f.id != ex)
        })?;
        Ok(!matches.is_empty())
    }

    async fn list(
        &self,
        ctx: &StoreContext,
        filter: &FieldFilter,
    ) -> TabulaResult<(Vec<Field>, u64)> {
        let tx = self.manager.scope(ctx)?;
        let mut fields: Vec<Field> = self
            .fields
            .scan(tx)?
            .into_iter()
            .filter(|f| filter.table_id.as_ref().map_or(true, |t| &f.table_id == t))
            .filter(|f| filter.field_type.map_or(true, |ft| f.field_type == ft))
            .collect();
        sort_fields(&mut fields);
        let total = fields.len() as u64;
        Ok((paginate(fields, filter.limit, filter.offset), total))
    }

    async fn save(&self, ctx: &StoreContext, field: &Field) -> TabulaResult<()> {
        let tx = self.manager.scope(ctx)?;
        let mut stored = field.clone();
        stored.updated_at = Utc::now();
        self.fields.put(tx, stored.id.clone(), stored)
    }

    async fn delete(&self, ctx: &StoreContext, id: &FieldId) -> TabulaResult<()> {
        let tx = self.manager.scope(ctx)?;
        if self.fields.get(tx, id)?.is_none() {
            return Err(field_not_found(id).into());
        }
        self.fields.remove(tx, id)
    }

    async fn batch_save(&self, ctx: &StoreContext, fields: &[Field]) -> TabulaResult<()> {
        for field in fields {
            self.save(ctx, field).await?;
        }
        Ok(())
    }

    async fn batch_delete(&self, ctx: &StoreContext, ids: &[FieldId]) -> TabulaResult<()> {
        let tx = self.manager.scope(ctx)?;
        for id in ids {
            self.fields.remove(tx, id)?;
        }
        Ok(())
    }

    async fn virtual_fields(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<Vec<Field>> {
        let tx = self.manager.scope(ctx)?;
        self.table_fields(tx, table_id, |f| f.field_type.is_virtual())
    }

    async fn computed_fields(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<Vec<Field>> {
        let tx = self.manager.scope(ctx)?;
        self.table_fields(tx, table_id, |f| f.field_type.is_computed())
    }

    async fn fields_by_type(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        field_type: FieldType,
    ) -> TabulaResult<Vec<Field>> {
        let tx = self.manager.scope(ctx)?;
        self.table_fields(tx, table_id, |f| f.field_type == field_type)
    }

    async fn update_order(
        &self,
        ctx: &StoreContext,
        id: &FieldId,
        order: f64,
    ) -> TabulaResult<()> {
        let tx = self.manager.scope(ctx)?;
        let mut field = self
            .fields
            .get(tx, id)?
            .ok_or_else(|| field_not_found(id))?;
        field.order = order;
        field.updated_at = Utc::now();
        self.fields.put(tx, id.clone(), field)
    }

    async fn max_order(&self, ctx: &StoreContext, table_id: &TableId) -> TabulaResult<f64> {
        let tx = self.manager.scope(ctx)?;
        Ok(self
            .table_fields(tx, table_id, |_| true)?
            .iter()
            .map(|f| f.order)
            .fold(0.0, f64::max))
    }

    fn next_id(&self) -> FieldId {
        FieldId::generate()
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// In-memory record store. Record ids are unique across tables.
pub struct InMemoryRecordRepository {
    manager: Arc<TransactionManager>,
    records: Arc<TxTable<RecordId, Record>>,
}

impl InMemoryRecordRepository {
    /// A store with its own transaction manager.
    pub fn new() -> TabulaResult<Self> {
        Self::with_manager(TransactionManager::new())
    }

    /// A store sharing transactions with other stores of `manager`.
    pub fn with_manager(manager: Arc<TransactionManager>) -> TabulaResult<Self> {
        let records = Arc::new(TxTable::new());
        register_table(&manager, &records)?;
        Ok(Self { manager, records })
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    fn table_records(
        &self,
        tx: Option<TransactionId>,
        table_id: Option<&TableId>,
    ) -> TabulaResult<Vec<Record>> {
        Ok(self
            .records
            .scan(tx)?
            .into_iter()
            .filter(|r| table_id.map_or(true, |t| &r.table_id == t))
            .collect())
    }

    fn store(&self, tx: Option<TransactionId>, record: &Record) -> TabulaResult<()> {
        let previous = self.records.get(tx, &record.id)?;
        let mut stored = record.clone();
        stored.version = previous
            .map(|p| p.version)
            .unwrap_or(RecordVersion::default())
            .next();
        stored.updated_at = Utc::now();
        self.records.put(tx, stored.id.clone(), stored)
    }
}

fn record_not_found(id: &RecordId) -> StorageError {
    StorageError::NotFound {
        entity_kind: EntityKind::Record,
        id: id.to_string(),
    }
}

impl RepositoryLayer for InMemoryRecordRepository {
    fn layer_name(&self) -> &'static str {
        "in_memory_record"
    }

    fn transaction_source(&self) -> Option<&dyn TransactionSource> {
        Some(self.manager.as_ref())
    }
}

#[async_trait]
impl RecordRepository for InMemoryRecordRepository {
    async fn find_by_table_and_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        id: &RecordId,
    ) -> TabulaResult<Option<Record>> {
        let tx = self.manager.scope(ctx)?;
        Ok(self
            .records
            .get(tx, id)?
            .filter(|r| &r.table_id == table_id))
    }

    async fn find_by_id(
        &self,
        ctx: &StoreContext,
        id: &RecordId,
    ) -> TabulaResult<Option<Record>> {
        let tx = self.manager.scope(ctx)?;
        self.records.get(tx, id)
    }

    async fn find_by_ids(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        ids: &[RecordId],
    ) -> TabulaResult<Vec<Record>> {
        let tx = self.manager.scope(ctx)?;
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.records.get(tx, id)? {
                if &record.table_id == table_id {
                    found.push(record);
                }
            }
        }
        Ok(found)
    }

    async fn find_by_table_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<Vec<Record>> {
        let tx = self.manager.scope(ctx)?;
        self.table_records(tx, Some(table_id))
    }

    async fn list(&self, ctx: &StoreContext, filter: &RecordFilter) -> TabulaResult<RecordPage> {
        let tx = self.manager.scope(ctx)?;
        let records = self.table_records(tx, filter.table_id.as_ref())?;
        let total = records.len() as u64;
        Ok(RecordPage {
            records: paginate(records, filter.limit, filter.offset),
            total,
        })
    }

    async fn save(&self, ctx: &StoreContext, record: &Record) -> TabulaResult<()> {
        let tx = self.manager.scope(ctx)?;
        self.store(tx, record)
    }

    async fn delete_by_table_and_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        id: &RecordId,
    ) -> TabulaResult<()> {
        let tx = self.manager.scope(ctx)?;
        match self.records.get(tx, id)? {
            Some(record) if &record.table_id == table_id => self.records.remove(tx, id),
            _ => Err(record_not_found(id).into()),
        }
    }

    async fn delete(&self, ctx: &StoreContext, id: &RecordId) -> TabulaResult<()> {
        let tx = self.manager.scope(ctx)?;
        if self.records.get(tx, id)?.is_none() {
            return Err(record_not_found(id).into());
        }
        self.records.remove(tx, id)
    }

    async fn batch_save(&self, ctx: &StoreContext, records: &[Record]) -> TabulaResult<()> {
        let tx = self.manager.scope(ctx)?;
        for record in records {
            self.store(tx, record)?;
        }
        Ok(())
    }

    async fn batch_delete(&self, ctx: &StoreContext, ids: &[RecordId]) -> TabulaResult<()> {
        let tx = self.manager.scope(ctx)?;
        for id in ids {
            self.records.remove(tx, id)?;
        }
        Ok(())
    }

    async fn batch_delete_in_table(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        ids: &[RecordId],
    ) -> TabulaResult<()> {
        let tx = self.manager.scope(ctx)?;
        for id in ids {
            if self
                .records
                .get(tx, id)?
                .is_some_and(|r| &r.table_id == table_id)
            {
                self.records.remove(tx, id)?;
            }
        }
        Ok(())
    }

    async fn exists(&self, ctx: &StoreContext, id: &RecordId) -> TabulaResult<bool> {
        Ok(self.find_by_id(ctx, id).await?.is_some())
    }

    async fn count_by_table_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<u64> {
        let tx = self.manager.scope(ctx)?;
        Ok(self.table_records(tx, Some(table_id))?.len() as u64)
    }

    async fn find_with_version(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        id: &RecordId,
        version: RecordVersion,
    ) -> TabulaResult<Option<Record>> {
        Ok(self
            .find_by_table_and_id(ctx, table_id, id)
            .await?
            .filter(|r| r.version == version))
    }

    fn next_id(&self) -> RecordId {
        RecordId::generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabula_core::TabulaError;

    fn bg() -> StoreContext {
        StoreContext::background()
    }

    fn record(table: &str, id: &str) -> Record {
        Record::new(TableId::new(table), RecordId::new(id))
    }

    #[tokio::test]
    async fn test_save_bumps_version() {
        let repo = InMemoryRecordRepository::new().unwrap();
        let r = record("t1", "r1").with_field("a", json!(1));

        repo.save(&bg(), &r).await.unwrap();
        repo.save(&bg(), &r).await.unwrap();

        let stored = repo.find_by_id(&bg(), &r.id).await.unwrap().unwrap();
        assert_eq!(stored.version, RecordVersion(2));
        assert!(repo
            .find_with_version(&bg(), &r.table_id, &r.id, RecordVersion(2))
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .find_with_version(&bg(), &r.table_id, &r.id, RecordVersion(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_transaction_isolation_and_commit() {
        let repo = InMemoryRecordRepository::new().unwrap();
        let tx = repo.manager().begin().await.unwrap();
        let r = record("t1", "r1");

        repo.save(&tx, &r).await.unwrap();
        assert!(repo.exists(&tx, &r.id).await.unwrap());
        assert!(!repo.exists(&bg(), &r.id).await.unwrap());

        repo.manager().commit(&tx).await.unwrap();
        assert!(repo.exists(&bg(), &r.id).await.unwrap());
        assert_eq!(repo.manager().open_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes_and_tombstones() {
        let repo = InMemoryRecordRepository::new().unwrap();
        let kept = record("t1", "kept");
        repo.save(&bg(), &kept).await.unwrap();

        let tx = repo.manager().begin().await.unwrap();
        repo.delete(&tx, &kept.id).await.unwrap();
        repo.save(&tx, &record("t1", "temp")).await.unwrap();
        assert!(!repo.exists(&tx, &kept.id).await.unwrap());

        repo.manager().rollback(&tx).await.unwrap();
        assert!(repo.exists(&bg(), &kept.id).await.unwrap());
        assert!(!repo.exists(&bg(), &RecordId::new("temp")).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_transaction_is_rejected() {
        let repo = InMemoryRecordRepository::new().unwrap();
        let tx = repo.manager().begin().await.unwrap();
        repo.manager().commit(&tx).await.unwrap();

        let err = repo.find_by_id(&tx, &RecordId::new("r1")).await.unwrap_err();
        assert!(matches!(
            err,
            TabulaError::Storage(StorageError::TransactionNotFound { .. })
        ));
        assert!(repo.manager().commit(&tx).await.is_err());
    }

    #[tokio::test]
    async fn test_shared_manager_spans_fields_and_records() {
        let manager = TransactionManager::new();
        let fields = InMemoryFieldRepository::with_manager(manager.clone()).unwrap();
        let records = InMemoryRecordRepository::with_manager(manager.clone()).unwrap();

        let tx = manager.begin().await.unwrap();
        let field = Field::new(TableId::new("t1"), "Name", FieldType::Text);
        fields.save(&tx, &field).await.unwrap();
        records.save(&tx, &record("t1", "r1")).await.unwrap();
        manager.commit(&tx).await.unwrap();

        assert!(fields.exists(&bg(), &field.id).await.unwrap());
        assert!(records.exists(&bg(), &RecordId::new("r1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_pages_and_totals() {
        let repo = InMemoryRecordRepository::new().unwrap();
        for i in 0..5 {
            repo.save(&bg(), &record("t1", &format!("r{i}"))).await.unwrap();
        }
        repo.save(&bg(), &record("t2", "other")).await.unwrap();

        let page = repo
            .list(&bg(), &RecordFilter::page(TableId::new("t1"), 2, 2))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        let ids: Vec<_> = page.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r3"]);

        let all = repo.list(&bg(), &RecordFilter::default()).await.unwrap();
        assert_eq!(all.total, 6);
    }

    #[tokio::test]
    async fn test_delete_checks_owning_table() {
        let repo = InMemoryRecordRepository::new().unwrap();
        repo.save(&bg(), &record("t1", "r1")).await.unwrap();

        let err = repo
            .delete_by_table_and_id(&bg(), &TableId::new("t2"), &RecordId::new("r1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TabulaError::Storage(StorageError::NotFound { .. })));

        repo.batch_delete_in_table(&bg(), &TableId::new("t2"), &[RecordId::new("r1")])
            .await
            .unwrap();
        assert!(repo.exists(&bg(), &RecordId::new("r1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_field_queries() {
        let repo = InMemoryFieldRepository::new().unwrap();
        let t1 = TableId::new("t1");
        let name = Field::new(t1.clone(), "Name", FieldType::Text).with_order(2.0);
        let total = Field::new(t1.clone(), "Total", FieldType::Formula).with_order(1.0);
        let serial = Field::new(t1.clone(), "Serial", FieldType::AutoNumber).with_order(3.0);
        repo.batch_save(&bg(), &[name.clone(), total.clone(), serial.clone()])
            .await
            .unwrap();

        let ordered = repo.find_by_table_id(&bg(), &t1).await.unwrap();
        let names: Vec<_> = ordered.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Total", "Name", "Serial"]);

        assert_eq!(repo.virtual_fields(&bg(), &t1).await.unwrap().len(), 1);
        assert_eq!(repo.computed_fields(&bg(), &t1).await.unwrap().len(), 2);
        assert_eq!(repo.max_order(&bg(), &t1).await.unwrap(), 3.0);
        assert_eq!(repo.max_order(&bg(), &TableId::new("empty")).await.unwrap(), 0.0);

        assert!(repo.exists_by_name(&bg(), &t1, "Name", None).await.unwrap());
        assert!(!repo
            .exists_by_name(&bg(), &t1, "Name", Some(&name.id))
            .await
            .unwrap());

        repo.update_order(&bg(), &name.id, 0.5).await.unwrap();
        let first = repo.find_by_table_id(&bg(), &t1).await.unwrap();
        assert_eq!(first[0].id, name.id);

        let (page, count) = repo
            .list(
                &bg(),
                &FieldFilter {
                    table_id: Some(t1.clone()),
                    limit: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_field_errors() {
        let repo = InMemoryFieldRepository::new().unwrap();
        let missing = FieldId::new("nope");
        assert!(repo.delete(&bg(), &missing).await.is_err());
        assert!(repo.update_order(&bg(), &missing, 1.0).await.is_err());
        repo.batch_delete(&bg(), &[missing]).await.unwrap();
    }
}
