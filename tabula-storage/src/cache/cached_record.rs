//! Cache-consistent record repository.
//!
//! Three read classes are cached:
//!
//! - point reads by table and id, with the record TTL;
//! - the per-table collection read, with the record TTL;
//! - pages of a table listing, with the shorter list TTL.
//!
//! Listings are invalidated wholesale through `record:list:{table}:*`
//! whenever any record of the table is written, since a write cannot tell
//! which cached pages it affects.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tabula_core::{
    CacheTtlConfig, EntityKind, Record, RecordId, RecordVersion, StoreContext, TableId,
    TabulaResult, DEFAULT_RECORD_LIST_TTL, DEFAULT_RECORD_TTL,
};

use super::aside::{CacheAside, ReadKind};
use super::key::{CacheKey, InvalidationPattern};
use super::provider::CacheProvider;
use crate::capability::RepositoryLayer;
use crate::repository::{RecordFilter, RecordPage, RecordRepository};

/// [`RecordRepository`] wrapper adding cache-aside reads and write
/// invalidation.
pub struct CachedRecordRepository<R, C: ?Sized> {
    inner: R,
    cache: CacheAside<C>,
    ttl: Duration,
    list_ttl: Duration,
}

impl<R, C> CachedRecordRepository<R, C>
where
    R: RecordRepository,
    C: CacheProvider + ?Sized,
{
    /// Wrap `inner`. A zero `ttl` selects the default record TTL; listings
    /// use the default list TTL, capped at `ttl`.
    pub fn new(inner: R, cache: Arc<C>, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_RECORD_TTL } else { ttl };
        Self {
            inner,
            cache: CacheAside::new(cache, EntityKind::Record),
            ttl,
            list_ttl: DEFAULT_RECORD_LIST_TTL.min(ttl),
        }
    }

    pub fn from_config(inner: R, cache: Arc<C>, config: &CacheTtlConfig) -> Self {
        let mut repo = Self::new(inner, cache, config.record_ttl);
        repo.list_ttl = config.record_list_ttl.min(repo.ttl);
        repo
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn list_ttl(&self) -> Duration {
        self.list_ttl
    }

    /// Invalidate point keys and the listings of every table touched.
    async fn invalidate_in_tables<'a>(
        &self,
        records: impl IntoIterator<Item = (&'a TableId, &'a RecordId)>,
    ) {
        let mut keys = BTreeSet::new();
        let mut tables = BTreeSet::new();
        for (table_id, record_id) in records {
            keys.insert(CacheKey::record_by_id(table_id, record_id));
            tables.insert(table_id);
        }
        let keys: Vec<CacheKey> = keys.into_iter().collect();
        let patterns: Vec<InvalidationPattern> = tables
            .into_iter()
            .map(InvalidationPattern::record_listings_of_table)
            .collect();
        self.cache.invalidate(&keys, &patterns).await;
    }

    /// Read where each record lives before it is overwritten, so a save that
    /// moves it to another table can clear the old table's keys too.
    async fn stored_locations(&self, ctx: &StoreContext, records: &[Record]) -> Vec<Previous> {
        let mut previous = Vec::with_capacity(records.len());
        for record in records {
            match self.inner.find_by_id(ctx, &record.id).await {
                Ok(Some(stored)) if stored.table_id != record.table_id => {
                    previous.push(Previous::Moved(stored.table_id, record.id.clone()));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        record_id = %record.id,
                        error = %e,
                        "Could not resolve record table before write"
                    );
                    previous.push(Previous::Unknown(record.id.clone()));
                }
            }
        }
        previous
    }

    async fn invalidate_previous(&self, previous: Vec<Previous>) {
        let mut moved = Vec::new();
        let mut unknown = Vec::new();
        for entry in previous {
            match entry {
                Previous::Moved(table_id, record_id) => moved.push((table_id, record_id)),
                Previous::Unknown(record_id) => unknown.push(record_id),
            }
        }
        if !moved.is_empty() {
            self.invalidate_in_tables(moved.iter().map(|(t, r)| (t, r))).await;
        }
        if !unknown.is_empty() {
            self.invalidate_anywhere(&unknown).await;
        }
    }

    /// Invalidate records whose table is unknown: any key ending in each id,
    /// plus every listing of every table.
    async fn invalidate_anywhere(&self, ids: &[RecordId]) {
        let mut patterns: Vec<InvalidationPattern> =
            ids.iter().map(InvalidationPattern::record_any_parent).collect();
        patterns.push(InvalidationPattern::all_record_listings());
        self.cache.invalidate(&[], &patterns).await;
    }
}

/// Where a record lived before a save.
enum Previous {
    Moved(TableId, RecordId),
    Unknown(RecordId),
}

impl<R, C> RepositoryLayer for CachedRecordRepository<R, C>
where
    R: RecordRepository,
    C: CacheProvider + ?Sized,
{
    fn layer_name(&self) -> &'static str {
        "cached_record"
    }

    fn inner_layer(&self) -> Option<&dyn RepositoryLayer> {
        Some(&self.inner)
    }
}

#[async_trait]
impl<R, C> RecordRepository for CachedRecordRepository<R, C>
where
    R: RecordRepository,
    C: CacheProvider + ?Sized,
{
    async fn find_by_table_and_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        id: &RecordId,
    ) -> TabulaResult<Option<Record>> {
        if ctx.is_in_transaction() {
            self.cache.note_bypass(ReadKind::Point);
            return self.inner.find_by_table_and_id(ctx, table_id, id).await;
        }

        let key = CacheKey::record_by_id(table_id, id);
        if let Some(record) = self.cache.read::<Record>(&key, ReadKind::Point).await {
            return Ok(Some(record));
        }

        let found = self.inner.find_by_table_and_id(ctx, table_id, id).await?;
        if let Some(record) = &found {
            self.cache.populate(&key, record, self.ttl).await;
        }
        Ok(found)
    }

    async fn find_by_id(
        &self,
        ctx: &StoreContext,
        id: &RecordId,
    ) -> TabulaResult<Option<Record>> {
        self.inner.find_by_id(ctx, id).await
    }

    async fn find_by_ids(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        ids: &[RecordId],
    ) -> TabulaResult<Vec<Record>> {
        self.inner.find_by_ids(ctx, table_id, ids).await
    }

    async fn find_by_table_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<Vec<Record>> {
        if ctx.is_in_transaction() {
            self.cache.note_bypass(ReadKind::Collection);
            return self.inner.find_by_table_id(ctx, table_id).await;
        }

        let key = CacheKey::records_by_table(table_id);
        if let Some(records) = self
            .cache
            .read::<Vec<Record>>(&key, ReadKind::Collection)
            .await
        {
            return Ok(records);
        }

        let records = self.inner.find_by_table_id(ctx, table_id).await?;
        self.cache.populate(&key, &records, self.ttl).await;
        Ok(records)
    }

    async fn list(&self, ctx: &StoreContext, filter: &RecordFilter) -> TabulaResult<RecordPage> {
        let Some(table_id) = filter.table_id.as_ref() else {
            return self.inner.list(ctx, filter).await;
        };
        if ctx.is_in_transaction() {
            self.cache.note_bypass(ReadKind::Page);
            return self.inner.list(ctx, filter).await;
        }

        let key = CacheKey::record_page(table_id, filter.limit, filter.offset);
        if let Some(page) = self.cache.read::<RecordPage>(&key, ReadKind::Page).await {
            return Ok(page);
        }

        let page = self.inner.list(ctx, filter).await?;
        self.cache.populate(&key, &page, self.list_ttl).await;
        Ok(page)
    }

    async fn save(&self, ctx: &StoreContext, record: &Record) -> TabulaResult<()> {
        let previous = self
            .stored_locations(ctx, std::slice::from_ref(record))
            .await;
        self.inner.save(ctx, record).await?;
        self.invalidate_in_tables([(&record.table_id, &record.id)])
            .await;
        self.invalidate_previous(previous).await;
        Ok(())
    }

    async fn delete_by_table_and_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        id: &RecordId,
    ) -> TabulaResult<()> {
        self.inner.delete_by_table_and_id(ctx, table_id, id).await?;
        self.invalidate_in_tables([(table_id, id)]).await;
        Ok(())
    }

    async fn delete(&self, ctx: &StoreContext, id: &RecordId) -> TabulaResult<()> {
        self.inner.delete(ctx, id).await?;
        self.invalidate_anywhere(std::slice::from_ref(id)).await;
        Ok(())
    }

    async fn batch_save(&self, ctx: &StoreContext, records: &[Record]) -> TabulaResult<()> {
        let previous = self.stored_locations(ctx, records).await;
        self.inner.batch_save(ctx, records).await?;
        self.invalidate_in_tables(records.iter().map(|r| (&r.table_id, &r.id)))
            .await;
        self.invalidate_previous(previous).await;
        Ok(())
    }

    async fn batch_delete(&self, ctx: &StoreContext, ids: &[RecordId]) -> TabulaResult<()> {
        self.inner.batch_delete(ctx, ids).await?;
        self.invalidate_anywhere(ids).await;
        Ok(())
    }

    async fn batch_delete_in_table(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        ids: &[RecordId],
    ) -> TabulaResult<()> {
        self.inner.batch_delete_in_table(ctx, table_id, ids).await?;
        if ids.is_empty() {
            return Ok(());
        }
        self.invalidate_in_tables(ids.iter().map(|id| (table_id, id)))
            .await;
        Ok(())
    }

    async fn exists(&self, ctx: &StoreContext, id: &RecordId) -> TabulaResult<bool> {
        self.inner.exists(ctx, id).await
    }

    async fn count_by_table_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<u64> {
        self.inner.count_by_table_id(ctx, table_id).await
    }

    async fn find_with_version(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        id: &RecordId,
        version: RecordVersion,
    ) -> TabulaResult<Option<Record>> {
        self.inner.find_with_version(ctx, table_id, id, version).await
    }

    fn next_id(&self) -> RecordId {
        self.inner.next_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheProvider;
    use crate::memory::InMemoryRecordRepository;
    use serde_json::json;

    type Repo = CachedRecordRepository<InMemoryRecordRepository, InMemoryCacheProvider>;

    fn setup() -> (Repo, Arc<InMemoryCacheProvider>) {
        let cache = Arc::new(InMemoryCacheProvider::new());
        let repo = CachedRecordRepository::new(
            InMemoryRecordRepository::new().unwrap(),
            cache.clone(),
            Duration::ZERO,
        );
        (repo, cache)
    }

    fn record(table: &str, id: &str) -> Record {
        Record::new(TableId::new(table), RecordId::new(id))
    }

    #[test]
    fn test_ttl_classes() {
        let (repo, _) = setup();
        assert_eq!(repo.ttl(), DEFAULT_RECORD_TTL);
        assert_eq!(repo.list_ttl(), DEFAULT_RECORD_LIST_TTL);

        let short = CachedRecordRepository::new(
            InMemoryRecordRepository::new().unwrap(),
            Arc::new(InMemoryCacheProvider::new()),
            Duration::from_secs(10),
        );
        assert_eq!(short.list_ttl(), Duration::from_secs(10));

        let configured = CachedRecordRepository::from_config(
            InMemoryRecordRepository::new().unwrap(),
            Arc::new(InMemoryCacheProvider::new()),
            &CacheTtlConfig::new().with_record_list_ttl(Duration::from_secs(5)),
        );
        assert_eq!(configured.list_ttl(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_save_replaces_stale_point_read() {
        let (repo, _cache) = setup();
        let ctx = StoreContext::background();
        let r1 = record("t1", "r1").with_field("a", json!(1));
        repo.save(&ctx, &r1).await.unwrap();

        let cached = repo
            .find_by_table_and_id(&ctx, &r1.table_id, &r1.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.get(&"a".into()), Some(&json!(1)));

        repo.save(&ctx, &r1.clone().with_field("a", json!(2)))
            .await
            .unwrap();
        let fresh = repo
            .find_by_table_and_id(&ctx, &r1.table_id, &r1.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.get(&"a".into()), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_pages_cached_and_invalidated_per_table() {
        let (repo, cache) = setup();
        let ctx = StoreContext::background();
        let t1 = TableId::new("t1");
        let t2 = TableId::new("t2");
        repo.batch_save(&ctx, &[record("t1", "a"), record("t2", "b")])
            .await
            .unwrap();

        let page_key = CacheKey::record_page(&t1, 10, 0);
        let other_key = CacheKey::record_page(&t2, 10, 0);
        repo.list(&ctx, &RecordFilter::page(t1.clone(), 10, 0))
            .await
            .unwrap();
        repo.list(&ctx, &RecordFilter::page(t2.clone(), 10, 0))
            .await
            .unwrap();
        assert!(cache.contains(&page_key).await);

        repo.save(&ctx, &record("t1", "c")).await.unwrap();
        assert!(!cache.contains(&page_key).await);
        assert!(cache.contains(&other_key).await);

        let page = repo
            .list(&ctx, &RecordFilter::page(t1, 10, 0))
            .await
            .unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn test_unscoped_list_is_not_cached() {
        let (repo, cache) = setup();
        let ctx = StoreContext::background();
        repo.save(&ctx, &record("t1", "a")).await.unwrap();

        let page = repo.list(&ctx, &RecordFilter::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_collection_read_invalidated_by_member_write() {
        let (repo, cache) = setup();
        let ctx = StoreContext::background();
        let t1 = TableId::new("t1");
        repo.save(&ctx, &record("t1", "a")).await.unwrap();

        assert_eq!(repo.find_by_table_id(&ctx, &t1).await.unwrap().len(), 1);
        assert!(cache.contains(&CacheKey::records_by_table(&t1)).await);

        repo.delete_by_table_and_id(&ctx, &t1, &RecordId::new("a"))
            .await
            .unwrap();
        assert!(repo.find_by_table_id(&ctx, &t1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_moving_record_clears_old_table_keys() {
        let (repo, cache) = setup();
        let ctx = StoreContext::background();
        let t1 = TableId::new("t1");
        let r1 = record("t1", "r1");
        repo.save(&ctx, &r1).await.unwrap();
        repo.find_by_table_and_id(&ctx, &t1, &r1.id).await.unwrap();
        assert_eq!(repo.find_by_table_id(&ctx, &t1).await.unwrap().len(), 1);

        repo.batch_save(&ctx, &[record("t2", "r1")]).await.unwrap();

        assert!(!cache.contains(&CacheKey::record_by_id(&t1, &r1.id)).await);
        assert!(!cache.contains(&CacheKey::records_by_table(&t1)).await);
        assert!(repo.find_by_table_id(&ctx, &t1).await.unwrap().is_empty());

        repo.find_by_table_id(&ctx, &TableId::new("t2")).await.unwrap();
        repo.save(&ctx, &record("t1", "r1")).await.unwrap();
        assert!(!cache.contains(&CacheKey::records_by_table(&TableId::new("t2"))).await);
    }

    #[tokio::test]
    async fn test_delete_without_table_clears_every_parent() {
        let (repo, cache) = setup();
        let ctx = StoreContext::background();
        let r1 = record("t1", "r1");
        repo.save(&ctx, &r1).await.unwrap();
        repo.find_by_table_and_id(&ctx, &r1.table_id, &r1.id)
            .await
            .unwrap();
        repo.list(&ctx, &RecordFilter::page(TableId::new("t9"), 5, 0))
            .await
            .unwrap();

        repo.delete(&ctx, &r1.id).await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_batch_delete_in_table_is_precise() {
        let (repo, cache) = setup();
        let ctx = StoreContext::background();
        let t1 = TableId::new("t1");
        let t2 = TableId::new("t2");
        repo.batch_save(&ctx, &[record("t1", "a"), record("t2", "b")])
            .await
            .unwrap();
        repo.find_by_table_and_id(&ctx, &t2, &RecordId::new("b"))
            .await
            .unwrap();
        repo.find_by_table_id(&ctx, &t2).await.unwrap();

        repo.batch_delete_in_table(&ctx, &t1, &[RecordId::new("a")])
            .await
            .unwrap();
        assert!(cache
            .contains(&CacheKey::record_by_id(&t2, &RecordId::new("b")))
            .await);
        assert!(cache.contains(&CacheKey::records_by_table(&t2)).await);
    }

    #[tokio::test]
    async fn test_failed_write_skips_invalidation() {
        let (repo, cache) = setup();
        let ctx = StoreContext::background();
        let r1 = record("t1", "r1");
        repo.save(&ctx, &r1).await.unwrap();
        repo.find_by_table_and_id(&ctx, &r1.table_id, &r1.id)
            .await
            .unwrap();

        let err = repo
            .delete_by_table_and_id(&ctx, &TableId::new("t2"), &r1.id)
            .await;
        assert!(err.is_err());
        assert!(cache
            .contains(&CacheKey::record_by_id(&r1.table_id, &r1.id))
            .await);
    }
}
