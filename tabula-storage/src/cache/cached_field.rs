//! Cache-consistent field repository.
//!
//! Field metadata is read far more often than it changes, so point reads and
//! per-table reads are cached with the long field TTL. Every write
//! invalidates the field's point key and its table's listing key after the
//! authoritative write succeeds.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tabula_core::{
    CacheTtlConfig, EntityKind, Field, FieldId, FieldType, StoreContext, TableId, TabulaResult,
    DEFAULT_FIELD_TTL,
};

use super::aside::{CacheAside, ReadKind};
use super::key::{CacheKey, InvalidationPattern};
use super::provider::CacheProvider;
use crate::capability::RepositoryLayer;
use crate::repository::{FieldFilter, FieldRepository};

/// [`FieldRepository`] wrapper adding cache-aside reads and write
/// invalidation.
pub struct CachedFieldRepository<R, C: ?Sized> {
    inner: R,
    cache: CacheAside<C>,
    ttl: Duration,
}

impl<R, C> CachedFieldRepository<R, C>
where
    R: FieldRepository,
    C: CacheProvider + ?Sized,
{
    /// Wrap `inner`. A zero `ttl` selects the default field TTL.
    pub fn new(inner: R, cache: Arc<C>, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_FIELD_TTL } else { ttl };
        Self {
            inner,
            cache: CacheAside::new(cache, EntityKind::Field),
            ttl,
        }
    }

    pub fn from_config(inner: R, cache: Arc<C>, config: &CacheTtlConfig) -> Self {
        Self::new(inner, cache, config.field_ttl)
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Drop the point key of every id and every field, then the listing
    /// of every table the fields belong to.
    async fn invalidate_fields<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a FieldId>,
        fields: impl IntoIterator<Item = &'a Field>,
    ) {
        let mut keys: BTreeSet<CacheKey> = ids.into_iter().map(CacheKey::field_by_id).collect();
        let mut tables = BTreeSet::new();
        for field in fields {
            keys.insert(CacheKey::field_by_id(&field.id));
            tables.insert(&field.table_id);
        }
        let keys: Vec<CacheKey> = keys.into_iter().collect();
        let patterns: Vec<InvalidationPattern> = tables
            .into_iter()
            .map(InvalidationPattern::fields_of_table)
            .collect();
        self.cache.invalidate(&keys, &patterns).await;
    }

    /// Current state of `ids`, read before a write that only knows ids.
    async fn prefetch(&self, ctx: &StoreContext, ids: &[FieldId]) -> Vec<Field> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match self.inner.find_by_id(ctx, id).await {
                Ok(Some(field)) => found.push(field),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    field_id = %id,
                    error = %e,
                    "Could not resolve field table before write"
                ),
            }
        }
        found
    }
}

impl<R, C> RepositoryLayer for CachedFieldRepository<R, C>
where
    R: FieldRepository,
    C: CacheProvider + ?Sized,
{
    fn layer_name(&self) -> &'static str {
        "cached_field"
    }

    fn inner_layer(&self) -> Option<&dyn RepositoryLayer> {
        Some(&self.inner)
    }
}

#[async_trait]
impl<R, C> FieldRepository for CachedFieldRepository<R, C>
where
    R: FieldRepository,
    C: CacheProvider + ?Sized,
{
    async fn find_by_id(&self, ctx: &StoreContext, id: &FieldId) -> TabulaResult<Option<Field>> {
        if ctx.is_in_transaction() {
            self.cache.note_bypass(ReadKind::Point);
            return self.inner.find_by_id(ctx, id).await;
        }

        let key = CacheKey::field_by_id(id);
        if let Some(field) = self.cache.read::<Field>(&key, ReadKind::Point).await {
            return Ok(Some(field));
        }

        let found = self.inner.find_by_id(ctx, id).await?;
        if let Some(field) = &found {
            self.cache.populate(&key, field, self.ttl).await;
        }
        Ok(found)
    }

    async fn find_by_table_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<Vec<Field>> {
        if ctx.is_in_transaction() {
            self.cache.note_bypass(ReadKind::Collection);
            return self.inner.find_by_table_id(ctx, table_id).await;
        }

        let key = CacheKey::fields_by_table(table_id);
        if let Some(fields) = self
            .cache
            .read::<Vec<Field>>(&key, ReadKind::Collection)
            .await
        {
            return Ok(fields);
        }

        let fields = self.inner.find_by_table_id(ctx, table_id).await?;
        self.cache.populate(&key, &fields, self.ttl).await;
        Ok(fields)
    }

    async fn find_by_name(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        name: &str,
    ) -> TabulaResult<Option<Field>> {
        self.inner.find_by_name(ctx, table_id, name).await
    }

    async fn exists(&self, ctx: &StoreContext, id: &FieldId) -> TabulaResult<bool> {
        self.inner.exists(ctx, id).await
    }

    async fn exists_by_name(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        name: &str,
        exclude: Option<&FieldId>,
    ) -> TabulaResult<bool> {
        self.inner.exists_by_name(ctx, table_id, name, exclude).await
    }

    async fn list(
        &self,
        ctx: &StoreContext,
        filter: &FieldFilter,
    ) -> TabulaResult<(Vec<Field>, u64)> {
        self.inner.list(ctx, filter).await
    }

    async fn save(&self, ctx: &StoreContext, field: &Field) -> TabulaResult<()> {
        let before = self.prefetch(ctx, std::slice::from_ref(&field.id)).await;
        self.inner.save(ctx, field).await?;
        self.invalidate_fields(std::iter::empty(), before.iter().chain([field]))
            .await;
        Ok(())
    }

    async fn delete(&self, ctx: &StoreContext, id: &FieldId) -> TabulaResult<()> {
        let before = self.prefetch(ctx, std::slice::from_ref(id)).await;
        self.inner.delete(ctx, id).await?;
        self.invalidate_fields([id], &before).await;
        Ok(())
    }

    async fn batch_save(&self, ctx: &StoreContext, fields: &[Field]) -> TabulaResult<()> {
        let ids: Vec<FieldId> = fields.iter().map(|f| f.id.clone()).collect();
        let before = self.prefetch(ctx, &ids).await;
        self.inner.batch_save(ctx, fields).await?;
        self.invalidate_fields(std::iter::empty(), before.iter().chain(fields))
            .await;
        Ok(())
    }

    async fn batch_delete(&self, ctx: &StoreContext, ids: &[FieldId]) -> TabulaResult<()> {
        let before = self.prefetch(ctx, ids).await;
        self.inner.batch_delete(ctx, ids).await?;
        self.invalidate_fields(ids, &before).await;
        Ok(())
    }

    async fn virtual_fields(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<Vec<Field>> {
        self.inner.virtual_fields(ctx, table_id).await
    }

    async fn computed_fields(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<Vec<Field>> {
        self.inner.computed_fields(ctx, table_id).await
    }

    async fn fields_by_type(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        field_type: FieldType,
    ) -> TabulaResult<Vec<Field>> {
        self.inner.fields_by_type(ctx, table_id, field_type).await
    }

    async fn update_order(
        &self,
        ctx: &StoreContext,
        id: &FieldId,
        order: f64,
    ) -> TabulaResult<()> {
        let before = self.prefetch(ctx, std::slice::from_ref(id)).await;
        self.inner.update_order(ctx, id, order).await?;
        self.invalidate_fields([id], &before).await;
        Ok(())
    }

    async fn max_order(&self, ctx: &StoreContext, table_id: &TableId) -> TabulaResult<f64> {
        self.inner.max_order(ctx, table_id).await
    }

    fn next_id(&self) -> FieldId {
        self.inner.next_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheProvider;
    use crate::capability::resolve_transaction_source;
    use crate::memory::InMemoryFieldRepository;

    fn setup() -> (
        CachedFieldRepository<InMemoryFieldRepository, InMemoryCacheProvider>,
        Arc<InMemoryCacheProvider>,
    ) {
        let cache = Arc::new(InMemoryCacheProvider::new());
        let repo = CachedFieldRepository::new(
            InMemoryFieldRepository::new().unwrap(),
            cache.clone(),
            Duration::ZERO,
        );
        (repo, cache)
    }

    #[test]
    fn test_zero_ttl_selects_default() {
        let (repo, _) = setup();
        assert_eq!(repo.ttl(), DEFAULT_FIELD_TTL);
    }

    #[tokio::test]
    async fn test_point_read_populates_cache() {
        let (repo, cache) = setup();
        let ctx = StoreContext::background();
        let field = Field::new(TableId::new("t1"), "Name", FieldType::Text);
        repo.inner().save(&ctx, &field).await.unwrap();

        let found = repo.find_by_id(&ctx, &field.id).await.unwrap();
        assert_eq!(found.as_ref().map(|f| &f.id), Some(&field.id));
        assert!(cache.contains(&CacheKey::field_by_id(&field.id)).await);
    }

    #[tokio::test]
    async fn test_absent_field_is_not_cached() {
        let (repo, cache) = setup();
        let ctx = StoreContext::background();
        let missing = FieldId::new("missing");

        assert!(repo.find_by_id(&ctx, &missing).await.unwrap().is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_save_invalidates_table_listing() {
        let (repo, cache) = setup();
        let ctx = StoreContext::background();
        let t1 = TableId::new("t1");
        repo.save(&ctx, &Field::new(t1.clone(), "A", FieldType::Text))
            .await
            .unwrap();

        assert_eq!(repo.find_by_table_id(&ctx, &t1).await.unwrap().len(), 1);
        assert!(cache.contains(&CacheKey::fields_by_table(&t1)).await);

        repo.save(&ctx, &Field::new(t1.clone(), "B", FieldType::Number))
            .await
            .unwrap();
        assert!(!cache.contains(&CacheKey::fields_by_table(&t1)).await);
        assert_eq!(repo.find_by_table_id(&ctx, &t1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_order_refreshes_cached_listing() {
        let (repo, _cache) = setup();
        let ctx = StoreContext::background();
        let t1 = TableId::new("t1");
        let a = Field::new(t1.clone(), "A", FieldType::Text).with_order(1.0);
        let b = Field::new(t1.clone(), "B", FieldType::Text).with_order(2.0);
        repo.batch_save(&ctx, &[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(repo.find_by_table_id(&ctx, &t1).await.unwrap()[0].id, a.id);

        repo.update_order(&ctx, &b.id, 0.0).await.unwrap();
        assert_eq!(repo.find_by_table_id(&ctx, &t1).await.unwrap()[0].id, b.id);
    }

    #[tokio::test]
    async fn test_batch_delete_invalidates_point_and_table_keys() {
        let (repo, cache) = setup();
        let ctx = StoreContext::background();
        let t1 = TableId::new("t1");
        let a = Field::new(t1.clone(), "A", FieldType::Text);
        repo.save(&ctx, &a).await.unwrap();
        repo.find_by_id(&ctx, &a.id).await.unwrap();
        repo.find_by_table_id(&ctx, &t1).await.unwrap();

        repo.batch_delete(&ctx, &[a.id.clone()]).await.unwrap();
        assert!(cache.is_empty().await);
        assert!(repo.find_by_id(&ctx, &a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transaction_reads_skip_cache() {
        let (repo, cache) = setup();
        let source = resolve_transaction_source(&repo, 8).unwrap();
        let tx = source.begin().await.unwrap();
        let field = Field::new(TableId::new("t1"), "Draft", FieldType::Text);
        repo.save(&tx, &field).await.unwrap();

        assert!(repo.find_by_id(&tx, &field.id).await.unwrap().is_some());
        assert_eq!(
            repo.find_by_table_id(&tx, &field.table_id).await.unwrap().len(),
            1
        );
        assert!(cache.is_empty().await);

        source.rollback(&tx).await.unwrap();
        let ctx = StoreContext::background();
        assert!(repo.find_by_id(&ctx, &field.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_moving_field_clears_old_table_listing() {
        let (repo, cache) = setup();
        let ctx = StoreContext::background();
        let t1 = TableId::new("t1");
        let t2 = TableId::new("t2");
        let field = Field::new(t1.clone(), "Roaming", FieldType::Text);
        repo.save(&ctx, &field).await.unwrap();
        assert_eq!(repo.find_by_table_id(&ctx, &t1).await.unwrap().len(), 1);
        assert!(cache.contains(&CacheKey::fields_by_table(&t1)).await);

        let mut moved = field.clone();
        moved.table_id = t2.clone();
        repo.save(&ctx, &moved).await.unwrap();

        assert!(!cache.contains(&CacheKey::fields_by_table(&t1)).await);
        assert!(repo.find_by_table_id(&ctx, &t1).await.unwrap().is_empty());
        assert_eq!(repo.find_by_table_id(&ctx, &t2).await.unwrap().len(), 1);
    }
}
