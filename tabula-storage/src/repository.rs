//! Authoritative repository contracts.
//!
//! Every call takes a [`StoreContext`]; a context carrying a transaction id
//! scopes the call to that transaction. Implementations are either
//! authoritative stores or wrappers around one (see
//! [`crate::capability::RepositoryLayer`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tabula_core::{
    Field, FieldId, FieldType, Record, RecordId, RecordVersion, StoreContext, TableId,
    TabulaResult,
};

use crate::capability::RepositoryLayer;

/// Filter for field listings. A `limit` of zero means unbounded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldFilter {
    pub table_id: Option<TableId>,
    pub field_type: Option<FieldType>,
    pub limit: usize,
    pub offset: usize,
}

impl FieldFilter {
    pub fn for_table(table_id: TableId) -> Self {
        Self {
            table_id: Some(table_id),
            ..Default::default()
        }
    }
}

/// Filter for record listings. A `limit` of zero means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub table_id: Option<TableId>,
    pub limit: usize,
    pub offset: usize,
}

impl RecordFilter {
    pub fn page(table_id: TableId, limit: usize, offset: usize) -> Self {
        Self {
            table_id: Some(table_id),
            limit,
            offset,
        }
    }
}

/// One page of a record listing plus the unpaged total.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPage {
    pub records: Vec<Record>,
    pub total: u64,
}

/// Field definitions store.
#[async_trait]
pub trait FieldRepository: RepositoryLayer {
    async fn find_by_id(&self, ctx: &StoreContext, id: &FieldId) -> TabulaResult<Option<Field>>;

    /// Every field of a table, in display order.
    async fn find_by_table_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<Vec<Field>>;

    async fn find_by_name(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        name: &str,
    ) -> TabulaResult<Option<Field>>;

    async fn exists(&self, ctx: &StoreContext, id: &FieldId) -> TabulaResult<bool>;

    /// True if another field of the table already uses `name`. `exclude`
    /// skips one field, so a rename can keep its own name.
    async fn exists_by_name(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        name: &str,
        exclude: Option<&FieldId>,
    ) -> TabulaResult<bool>;

    /// Filtered listing and the unpaged total.
    async fn list(
        &self,
        ctx: &StoreContext,
        filter: &FieldFilter,
    ) -> TabulaResult<(Vec<Field>, u64)>;

    /// Insert or replace.
    async fn save(&self, ctx: &StoreContext, field: &Field) -> TabulaResult<()>;

    async fn delete(&self, ctx: &StoreContext, id: &FieldId) -> TabulaResult<()>;

    async fn batch_save(&self, ctx: &StoreContext, fields: &[Field]) -> TabulaResult<()>;

    /// Delete every listed field that exists; absent ids are skipped.
    async fn batch_delete(&self, ctx: &StoreContext, ids: &[FieldId]) -> TabulaResult<()>;

    async fn virtual_fields(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<Vec<Field>>;

    async fn computed_fields(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<Vec<Field>>;

    async fn fields_by_type(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        field_type: FieldType,
    ) -> TabulaResult<Vec<Field>>;

    async fn update_order(&self, ctx: &StoreContext, id: &FieldId, order: f64)
        -> TabulaResult<()>;

    /// Highest display order in the table, `0.0` for an empty table.
    async fn max_order(&self, ctx: &StoreContext, table_id: &TableId) -> TabulaResult<f64>;

    fn next_id(&self) -> FieldId;
}

/// Records store.
#[async_trait]
pub trait RecordRepository: RepositoryLayer {
    async fn find_by_table_and_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        id: &RecordId,
    ) -> TabulaResult<Option<Record>>;

    async fn find_by_id(&self, ctx: &StoreContext, id: &RecordId)
        -> TabulaResult<Option<Record>>;

    /// Records of `table_id` among `ids`; missing ids are skipped.
    async fn find_by_ids(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        ids: &[RecordId],
    ) -> TabulaResult<Vec<Record>>;

    async fn find_by_table_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
    ) -> TabulaResult<Vec<Record>>;

    async fn list(&self, ctx: &StoreContext, filter: &RecordFilter) -> TabulaResult<RecordPage>;

    /// Insert or replace; bumps the stored version.
    async fn save(&self, ctx: &StoreContext, record: &Record) -> TabulaResult<()>;

    async fn delete_by_table_and_id(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        id: &RecordId,
    ) -> TabulaResult<()>;

    async fn delete(&self, ctx: &StoreContext, id: &RecordId) -> TabulaResult<()>;

    async fn batch_save(&self, ctx: &StoreContext, records: &[Record]) -> TabulaResult<()>;

    /// Delete by id alone; absent ids are skipped.
    async fn batch_delete(&self, ctx: &StoreContext, ids: &[RecordId]) -> TabulaResult<()>;

    /// Delete the listed records of one table; ids of other tables are
    /// skipped.
    async fn batch_delete_in_table(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        ids: &[RecordId],
    ) -> TabulaResult<()>;

    async fn exists(&self, ctx: &StoreContext, id: &RecordId) -> TabulaResult<bool>;

    async fn count_by_table_id(&self, ctx: &StoreContext, table_id: &TableId)
        -> TabulaResult<u64>;

    /// The record, only if its stored version equals `version`.
    async fn find_with_version(
        &self,
        ctx: &StoreContext,
        table_id: &TableId,
        id: &RecordId,
        version: RecordVersion,
    ) -> TabulaResult<Option<Record>>;

    fn next_id(&self) -> RecordId;
}
