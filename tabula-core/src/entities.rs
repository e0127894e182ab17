//! Entity types owned by the authoritative store.
//!
//! The cache and subscription layers only ever hold derived copies of these.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{FieldId, RecordId, TableId, Timestamp};

/// Entity kind discriminator, used for cache keys, metrics labels and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Field,
    Record,
}

impl EntityKind {
    /// Stable lowercase name, used as the first cache key segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Field => "field",
            Self::Record => "record",
        }
    }
}

/// Type of a field definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    LongText,
    Number,
    Checkbox,
    Date,
    SingleSelect,
    MultiSelect,
    Link,
    Attachment,
    Formula,
    Rollup,
    Lookup,
    Count,
    AutoNumber,
    CreatedTime,
    LastModifiedTime,
}

impl FieldType {
    /// Virtual fields hold no stored value; they are derived from other fields
    /// or other tables.
    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Formula | Self::Rollup | Self::Lookup | Self::Count)
    }

    /// Computed fields are never written by users.
    pub fn is_computed(&self) -> bool {
        self.is_virtual()
            || matches!(
                self,
                Self::AutoNumber | Self::CreatedTime | Self::LastModifiedTime
            )
    }
}

/// A field definition (column metadata) of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: FieldId,
    pub table_id: TableId,
    pub name: String,
    pub field_type: FieldType,
    /// Display order within the table.
    pub order: f64,
    /// Type-specific options (select choices, formula expression, ...).
    #[serde(default)]
    pub options: Value,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Field {
    /// Create a field with a generated id.
    pub fn new(table_id: TableId, name: impl Into<String>, field_type: FieldType) -> Self {
        let now = Utc::now();
        Self {
            id: FieldId::generate(),
            table_id,
            name: name.into(),
            field_type,
            order: 0.0,
            options: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set an explicit id.
    pub fn with_id(mut self, id: FieldId) -> Self {
        self.id = id;
        self
    }

    /// Set the display order.
    pub fn with_order(mut self, order: f64) -> Self {
        self.order = order;
        self
    }
}

/// Monotonic per-record version, bumped by every authoritative save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordVersion(pub u64);

impl RecordVersion {
    /// The version following this one.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// A keyed record: a mapping from field id to value inside one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub table_id: TableId,
    #[serde(default)]
    pub fields: BTreeMap<FieldId, Value>,
    #[serde(default)]
    pub version: RecordVersion,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Record {
    /// Create an empty record.
    pub fn new(table_id: TableId, id: RecordId) -> Self {
        let now = Utc::now();
        Self {
            id,
            table_id,
            fields: BTreeMap::new(),
            version: RecordVersion::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder-style field assignment.
    pub fn with_field(mut self, field_id: impl Into<FieldId>, value: Value) -> Self {
        self.set(field_id.into(), value);
        self
    }

    /// Get a field value.
    pub fn get(&self, field_id: &FieldId) -> Option<&Value> {
        self.fields.get(field_id)
    }

    /// Set a field value. `null` removes the field.
    pub fn set(&mut self, field_id: FieldId, value: Value) {
        if value.is_null() {
            self.fields.remove(&field_id);
        } else {
            self.fields.insert(field_id, value);
        }
    }

    /// Remove a field value, returning the previous one.
    pub fn unset(&mut self, field_id: &FieldId) -> Option<Value> {
        self.fields.remove(field_id)
    }

    /// Advance the version and touch `updated_at`.
    pub fn bump_version(&mut self) {
        self.version = self.version.next();
        self.updated_at = Utc::now();
    }
}
