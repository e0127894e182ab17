//! Tabula Test Utilities
//!
//! Centralized test infrastructure for the tabula workspace:
//! - Proptest generators for identifiers, values, fields and records
//! - Instrumented and failing cache providers
//! - Call-counting repository wrappers
//! - Test fixtures and custom assertions
//! - Tracing setup for tests

pub use tabula_core::{
    CacheTtlConfig, EntityKind, Field, FieldId, FieldType, LiveError, Record, RecordId,
    RecordVersion, StorageError, StoreContext, TableId, TabulaError, TabulaResult,
};
pub use tabula_storage::{
    CacheError, CacheKey, CacheProvider, CacheStats, InMemoryCacheProvider, InvalidationPattern,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Install a fmt subscriber honouring `RUST_LOG` and writing through the
/// test harness. Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// INSTRUMENTED CACHE PROVIDERS
// ============================================================================

/// One call observed by [`RecordingCacheProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCall {
    Get(String),
    Set { key: String, ttl: Duration },
    Delete(Vec<String>),
    InvalidatePattern(String),
}

/// In-memory provider that records every call made to it.
#[derive(Debug, Default)]
pub struct RecordingCacheProvider {
    inner: InMemoryCacheProvider,
    calls: Mutex<Vec<CacheCall>>,
}

impl RecordingCacheProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryCacheProvider {
        &self.inner
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<CacheCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn get_count(&self) -> usize {
        self.count(|c| matches!(c, CacheCall::Get(_)))
    }

    pub fn set_count(&self) -> usize {
        self.count(|c| matches!(c, CacheCall::Set { .. }))
    }

    /// Keys passed to `delete`, flattened.
    pub fn deleted_keys(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                CacheCall::Delete(keys) => Some(keys.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Patterns passed to `invalidate_pattern`.
    pub fn invalidated_patterns(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                CacheCall::InvalidatePattern(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// TTL of the most recent `set` of `key`.
    pub fn ttl_of(&self, key: &CacheKey) -> Option<Duration> {
        lock(&self.calls).iter().rev().find_map(|c| match c {
            CacheCall::Set { key: k, ttl } if k == key.as_str() => Some(*ttl),
            _ => None,
        })
    }

    fn count(&self, predicate: impl Fn(&CacheCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| predicate(c)).count()
    }

    fn push(&self, call: CacheCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl CacheProvider for RecordingCacheProvider {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        self.push(CacheCall::Get(key.to_string()));
        self.inner.get(key).await
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.push(CacheCall::Set {
            key: key.to_string(),
            ttl,
        });
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, keys: &[CacheKey]) -> Result<(), CacheError> {
        self.push(CacheCall::Delete(keys.iter().map(|k| k.to_string()).collect()));
        self.inner.delete(keys).await
    }

    async fn invalidate_pattern(&self, pattern: &InvalidationPattern) -> Result<u64, CacheError> {
        self.push(CacheCall::InvalidatePattern(pattern.to_string()));
        self.inner.invalidate_pattern(pattern).await
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        self.inner.stats().await
    }
}

/// Provider whose reads, writes and invalidations can be made to fail
/// independently. Starts with everything failing.
#[derive(Debug)]
pub struct FailingCacheProvider {
    inner: InMemoryCacheProvider,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_invalidations: AtomicBool,
    attempts: AtomicUsize,
}

impl Default for FailingCacheProvider {
    fn default() -> Self {
        Self {
            inner: InMemoryCacheProvider::new(),
            fail_reads: AtomicBool::new(true),
            fail_writes: AtomicBool::new(true),
            fail_invalidations: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
        }
    }
}

impl FailingCacheProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only invalidation fails; reads and writes work.
    pub fn failing_invalidation() -> Self {
        let provider = Self::new();
        provider.set_fail_reads(false);
        provider.set_fail_writes(false);
        provider
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_invalidations(&self, fail: bool) {
        self.fail_invalidations.store(fail, Ordering::SeqCst);
    }

    /// Calls received, failed or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryCacheProvider {
        &self.inner
    }

    fn check(&self, flag: &AtomicBool, op: &str) -> Result<(), CacheError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if flag.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable(format!("{op} refused by test provider")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheProvider for FailingCacheProvider {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        self.check(&self.fail_reads, "get")?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.check(&self.fail_writes, "set")?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, keys: &[CacheKey]) -> Result<(), CacheError> {
        self.check(&self.fail_invalidations, "delete")?;
        self.inner.delete(keys).await
    }

    async fn invalidate_pattern(&self, pattern: &InvalidationPattern) -> Result<u64, CacheError> {
        self.check(&self.fail_invalidations, "invalidate_pattern")?;
        self.inner.invalidate_pattern(pattern).await
    }
}

// ============================================================================
// CALL-COUNTING REPOSITORIES
// ============================================================================

pub mod counting {
    //! Repository wrappers counting the calls that reach the store.

    use super::*;
    use tabula_storage::{
        FieldFilter, FieldRepository, RecordFilter, RecordPage, RecordRepository,
        RepositoryLayer,
    };

    /// Per-method call counter.
    #[derive(Debug, Default)]
    pub struct CallCounter {
        calls: Mutex<HashMap<&'static str, usize>>,
    }

    impl CallCounter {
        pub fn hit(&self, method: &'static str) {
            *lock(&self.calls).entry(method).or_default() += 1;
        }

        /// Calls of `method`.
        pub fn get(&self, method: &str) -> usize {
            lock(&self.calls).get(method).copied().unwrap_or(0)
        }

        /// Calls of every method.
        pub fn total(&self) -> usize {
            lock(&self.calls).values().sum()
        }

        pub fn reset(&self) {
            lock(&self.calls).clear();
        }
    }

    /// Counts every call forwarded to the wrapped field repository.
    pub struct CountingFieldRepository<R> {
        inner: R,
        pub counter: CallCounter,
    }

    impl<R> CountingFieldRepository<R> {
        pub fn new(inner: R) -> Self {
            Self {
                inner,
                counter: CallCounter::default(),
            }
        }
    }

    impl<R: FieldRepository> RepositoryLayer for CountingFieldRepository<R> {
        fn layer_name(&self) -> &'static str {
            "counting_field"
        }

        fn inner_layer(&self) -> Option<&dyn RepositoryLayer> {
            Some(&self.inner)
        }
    }

    #[async_trait]
    impl<R: FieldRepository> FieldRepository for CountingFieldRepository<R> {
        async fn find_by_id(
            &self,
            ctx: &StoreContext,
            id: &FieldId,
        ) -> TabulaResult<Option<Field>> {
            self.counter.hit("find_by_id");
            self.inner.find_by_id(ctx, id).await
        }

        async fn find_by_table_id(
            &self,
            ctx: &StoreContext,
            table_id: &TableId,
        ) -> TabulaResult<Vec<Field>> {
            self.counter.hit("find_by_table_id");
            self.inner.find_by_table_id(ctx, table_id).await
        }

        async fn find_by_name(
            &self,
            ctx: &StoreContext,
            table_id: &TableId,
            name: &str,
        ) -> TabulaResult<Option<Field>> {
            self.counter.hit("find_by_name");
            self.inner.find_by_name(ctx, table_id, name).await
        }

        async fn exists(&self, ctx: &StoreContext, id: &FieldId) -> TabulaResult<bool> {
            self.counter.hit("exists");
            self.inner.exists(ctx, id).await
        }

        async fn exists_by_name(
            &self,
            ctx: &StoreContext,
            table_id: &TableId,
            name: &str,
            exclude: Option<&FieldId>,
        ) -> TabulaResult<bool> {
            self.counter.hit("exists_by_name");
            self.inner.exists_by_name(ctx, table_id, name, exclude).await
        }

        async fn list(
            &self,
            ctx: &StoreContext,
            filter: &FieldFilter,
        ) -> TabulaResult<(Vec<Field>, u64)> {
            self.counter.hit("list");
            self.inner.list(ctx, filter).await
        }

        async fn save(&self, ctx: &StoreContext, field: &Field) -> TabulaResult<()> {
            self.counter.hit("save");
            self.inner.save(ctx, field).await
        }

        async fn delete(&self, ctx: &StoreContext, id: &FieldId) -> TabulaResult<()> {
            self.counter.hit("delete");
            self.inner.delete(ctx, id).await
        }

        async fn batch_save(&self, ctx: &StoreContext, fields: &[Field]) -> TabulaResult<()> {
            self.counter.hit("batch_save");
            self.inner.batch_save(ctx, fields).await
        }

        async fn batch_delete(&self, ctx: &StoreContext, ids: &[FieldId]) -> TabulaResult<()> {
            self.counter.hit("batch_delete");
            self.inner.batch_delete(ctx, ids).await
        }

        async fn virtual_fields(
            &self,
            ctx: &StoreContext,
            table_id: &TableId,
        ) -> TabulaResult<Vec<Field>> {
            self.counter.hit("virtual_fields");
            self.inner.virtual_fields(ctx, table_id).await
        }

        async fn computed_fields(
            &self,
            ctx: &StoreContext,
            table_id: &TableId,
        ) -> TabulaResult<Vec<Field>> {
            self.counter.hit("computed_fields");
            self.inner.computed_fields(ctx, table_id).await
        }

        async fn fields_by_type(
            &self,
            ctx: &StoreContext,
            table_id: &TableId,
            field_type: FieldType,
        ) -> TabulaResult<Vec<Field>> {
            self.counter.hit("fields_by_type");
            self.inner.fields_by_type(ctx, table_id, field_type).await
        }

        async fn update_order(
            &self,
            ctx: &StoreContext,
            id: &FieldId,
            order: f64,
        ) -> TabulaResult<()> {
            self.counter.hit("update_order");
            self.inner.update_order(ctx, id, order).await
        }

        async fn max_order(&self, ctx: &StoreContext, table_id: &TableId) -> TabulaResult<f64> {
            self.counter.hit("max_order");
            self.inner.max_order(ctx, table_id).await
        }

        fn next_id(&self) -> FieldId {
            self.counter.hit("next_id");
            self.inner.next_id()
        }
    }

    /// Counts every call forwarded to the wrapped record repository.
    pub struct CountingRecordRepository<R> {
        inner: R,
        pub counter: CallCounter,
    }

    impl<R> CountingRecordRepository<R> {
        pub fn new(inner: R) -> Self {
            Self {
                inner,
                counter: CallCounter::default(),
            }
        }
    }

    impl<R: RecordRepository> RepositoryLayer for CountingRecordRepository<R> {
        fn layer_name(&self) -> &'static str {
            "counting_record"
        }

        fn inner_layer(&self) -> Option<&dyn RepositoryLayer> {
            Some(&self.inner)
        }
    }

    #[async_trait]
    impl<R: RecordRepository> RecordRepository for CountingRecordRepository<R> {
        async fn find_by_table_and_id(
            &self,
            ctx: &StoreContext,
            table_id: &TableId,
            id: &RecordId,
        ) -> TabulaResult<Option<Record>> {
            self.counter.hit("find_by_table_and_id");
            self.inner.find_by_table_and_id(ctx, table_id, id).await
        }

        async fn find_by_id(
            &self,
            ctx: &StoreContext,
            id: &RecordId,
        ) -> TabulaResult<Option<Record>> {
            self.counter.hit("find_by_id");
            self.inner.find_by_id(ctx, id).await
        }

        async fn find_by_ids(
            &self,
            ctx: &StoreContext,
            table_id: &TableId,
            ids: &[RecordId],
        ) -> TabulaResult<Vec<Record>> {
            self.counter.hit("find_by_ids");
            self.inner.find_by_ids(ctx, table_id, ids).await
        }

        async fn find_by_table_id(
            &self,
            ctx: &StoreContext,
            table_id: &TableId,
        ) -> TabulaResult<Vec<Record>> {
            self.counter.hit("find_by_table_id");
            self.inner.find_by_table_id(ctx, table_id).await
        }

        async fn list(
            &self,
            ctx: &StoreContext,
            filter: &RecordFilter,
        ) -> TabulaResult<RecordPage> {
            self.counter.hit("list");
            self.inner.list(ctx, filter).await
        }

        async fn save(&self, ctx: &StoreContext, record: &Record) -> TabulaResult<()> {
            self.counter.hit("save");
            self.inner.save(ctx, record).await
        }

        async fn delete_by_table_and_id(
            &self,
            ctx: &StoreContext,
            table_id: &TableId,
            id: &RecordId,
        ) -> TabulaResult<()> {
            self.counter.hit("delete_by_table_and_id");
            self.inner.delete_by_table_and_id(ctx, table_id, id).await
        }

        async fn delete(&self, ctx: &StoreContext, id: &RecordId) -> TabulaResult<()> {
            self.counter.hit("delete");
            self.inner.delete(ctx, id).await
        }

        async fn batch_save(&self, ctx: &StoreContext, records: &[Record]) -> TabulaResult<()> {
            self.counter.hit("batch_save");
            self.inner.batch_save(ctx, records).await
        }

        async fn batch_delete(&self, ctx: &StoreContext, ids: &[RecordId]) -> TabulaResult<()> {
            self.counter.hit("batch_delete");
            self.inner.batch_delete(ctx, ids).await
        }

        async fn batch_delete_in_table(
            &self,
            ctx: &StoreContext,
            table_id: &TableId,
            ids: &[RecordId],
        ) -> TabulaResult<()> {
            self.counter.hit("batch_delete_in_table");
            self.inner.batch_delete_in_table(ctx, table_id, ids).await
        }

        async fn exists(&self, ctx: &StoreContext, id: &RecordId) -> TabulaResult<bool> {
            self.counter.hit("exists");
            self.inner.exists(ctx, id).await
        }

        async fn count_by_table_id(
            &self,
            ctx: &StoreContext,
            table_id: &TableId,
        ) -> TabulaResult<u64> {
            self.counter.hit("count_by_table_id");
            self.inner.count_by_table_id(ctx, table_id).await
        }

        async fn find_with_version(
            &self,
            ctx: &StoreContext,
            table_id: &TableId,
            id: &RecordId,
            version: RecordVersion,
        ) -> TabulaResult<Option<Record>> {
            self.counter.hit("find_with_version");
            self.inner.find_with_version(ctx, table_id, id, version).await
        }

        fn next_id(&self) -> RecordId {
            self.counter.hit("next_id");
            self.inner.next_id()
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for tabula types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    /// Identifier text accepted by every id newtype.
    pub fn arb_id_text() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,15}"
    }

    pub fn arb_table_id() -> impl Strategy<Value = TableId> {
        arb_id_text().prop_map(TableId::new)
    }

    pub fn arb_record_id() -> impl Strategy<Value = RecordId> {
        arb_id_text().prop_map(RecordId::new)
    }

    pub fn arb_field_id() -> impl Strategy<Value = FieldId> {
        arb_id_text().prop_map(FieldId::new)
    }

    pub fn arb_field_type() -> impl Strategy<Value = FieldType> {
        prop_oneof![
            Just(FieldType::Text),
            Just(FieldType::LongText),
            Just(FieldType::Number),
            Just(FieldType::Checkbox),
            Just(FieldType::Date),
            Just(FieldType::SingleSelect),
            Just(FieldType::MultiSelect),
            Just(FieldType::Link),
            Just(FieldType::Attachment),
            Just(FieldType::Formula),
            Just(FieldType::Rollup),
            Just(FieldType::Lookup),
            Just(FieldType::Count),
            Just(FieldType::AutoNumber),
            Just(FieldType::CreatedTime),
            Just(FieldType::LastModifiedTime),
        ]
    }

    /// Non-null JSON leaf values.
    pub fn arb_scalar_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,24}".prop_map(Value::String),
        ]
    }

    /// Non-null JSON values, nested up to three levels.
    pub fn arb_field_value() -> impl Strategy<Value = Value> {
        arb_scalar_value().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    /// An optional field value; `None` stands for an absent value.
    pub fn arb_optional_value() -> impl Strategy<Value = Option<Value>> {
        prop::option::of(arb_field_value())
    }

    pub fn arb_field(table_id: TableId) -> impl Strategy<Value = Field> {
        (
            arb_field_id(),
            "[A-Z][a-z]{0,11}",
            arb_field_type(),
            0u32..1000,
        )
            .prop_map(move |(id, name, field_type, order)| {
                Field::new(table_id.clone(), name, field_type)
                    .with_id(id)
                    .with_order(f64::from(order))
            })
    }

    pub fn arb_record(table_id: TableId) -> impl Strategy<Value = Record> {
        (
            arb_record_id(),
            prop::collection::btree_map(arb_field_id(), arb_field_value(), 0..6),
        )
            .prop_map(move |(id, fields)| {
                let mut record = Record::new(table_id.clone(), id);
                record.fields = fields;
                record
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built entities for common scenarios.

    use super::*;
    use serde_json::json;

    pub fn table() -> TableId {
        TableId::new("t1")
    }

    pub fn other_table() -> TableId {
        TableId::new("t2")
    }

    /// Record `r1` of table `t1` holding `{a: value}`.
    pub fn record_with_a(value: i64) -> Record {
        Record::new(table(), RecordId::new("r1")).with_field("a", json!(value))
    }

    /// A text, a number and a formula field of table `t1`.
    pub fn table_fields() -> Vec<Field> {
        vec![
            Field::new(table(), "Name", FieldType::Text)
                .with_id(FieldId::new("name"))
                .with_order(1.0),
            Field::new(table(), "Amount", FieldType::Number)
                .with_id(FieldId::new("amount"))
                .with_order(2.0),
            Field::new(table(), "Total", FieldType::Formula)
                .with_id(FieldId::new("total"))
                .with_order(3.0),
        ]
    }

    pub fn background() -> StoreContext {
        StoreContext::background()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over tabula results.

    use super::*;

    /// Assert that a TabulaResult is a NotFound storage error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &TabulaResult<T>, kind: EntityKind) {
        match result {
            Err(TabulaError::Storage(StorageError::NotFound { entity_kind, .. })) => {
                assert_eq!(*entity_kind, kind, "Wrong entity kind in NotFound error");
            }
            other => panic!("Expected NotFound error for {:?}, got: {:?}", kind, other),
        }
    }

    /// Assert that a TabulaResult is an optimistic conflict.
    #[track_caller]
    pub fn assert_conflict<T: std::fmt::Debug>(result: &TabulaResult<T>) {
        match result {
            Err(e) if e.is_conflict() => {}
            other => panic!("Expected optimistic conflict, got: {:?}", other),
        }
    }

    /// Assert that a TabulaResult is a specific live error.
    #[track_caller]
    pub fn assert_live_error<T: std::fmt::Debug>(result: &TabulaResult<T>, expected: &LiveError) {
        match result {
            Err(TabulaError::Live(e)) => assert_eq!(e, expected),
            other => panic!("Expected {:?}, got: {:?}", expected, other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
