//! Cache keys and invalidation patterns.
//!
//! Keys are `:`-joined segments: entity kind, lookup dimension, then the
//! lookup values. Values are percent-escaped (`%` as `%25`, `:` as `%3A`,
//! `*` as `%2A`) so an id can never shift segment boundaries or act as a
//! pattern wildcard, whether or not it went through `parse`.
//!
//! | Read                    | Key                                   |
//! |-------------------------|---------------------------------------|
//! | field by id             | `field:id:{field}`                    |
//! | fields of a table       | `field:table:{table}`                 |
//! | record by id            | `record:id:{table}:{record}`          |
//! | records of a table      | `record:list:{table}:all`             |
//! | page of records         | `record:list:{table}:{limit}:{offset}`|

use std::borrow::Cow;
use std::fmt;

use regex::Regex;
use tabula_core::{EntityKind, FieldId, RecordId, TableId};

use super::provider::CacheError;

const SEPARATOR: char = ':';
const WILDCARD: &str = "*";

/// Escape one key segment.
pub fn escape_segment(value: &str) -> Cow<'_, str> {
    if !value.contains(['%', ':', '*']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            '*' => escaped.push_str("%2A"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

/// Deterministic composite cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from its entity kind, lookup dimension and lookup values.
    pub fn new(kind: EntityKind, dimension: &str, values: &[&str]) -> Self {
        let mut key = String::with_capacity(32);
        key.push_str(kind.as_str());
        key.push(SEPARATOR);
        key.push_str(dimension);
        for value in values {
            key.push(SEPARATOR);
            key.push_str(&escape_segment(value));
        }
        Self(key)
    }

    /// Wrap an already rendered key, e.g. one read back from a backend.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn field_by_id(field_id: &FieldId) -> Self {
        Self::new(EntityKind::Field, "id", &[field_id.as_str()])
    }

    pub fn fields_by_table(table_id: &TableId) -> Self {
        Self::new(EntityKind::Field, "table", &[table_id.as_str()])
    }

    pub fn record_by_id(table_id: &TableId, record_id: &RecordId) -> Self {
        Self::new(
            EntityKind::Record,
            "id",
            &[table_id.as_str(), record_id.as_str()],
        )
    }

    /// Collection read of every record of a table.
    pub fn records_by_table(table_id: &TableId) -> Self {
        Self::new(EntityKind::Record, "list", &[table_id.as_str(), "all"])
    }

    /// One page of a table listing.
    pub fn record_page(table_id: &TableId, limit: usize, offset: usize) -> Self {
        Self::new(
            EntityKind::Record,
            "list",
            &[
                table_id.as_str(),
                &limit.to_string(),
                &offset.to_string(),
            ],
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Glob over cache keys. `*` matches any run of characters, `:` included,
/// the way Redis `KEYS` does.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvalidationPattern(String);

impl InvalidationPattern {
    pub fn new(glob: impl Into<String>) -> Self {
        Self(glob.into())
    }

    /// Pattern matching exactly one key.
    pub fn exact(key: &CacheKey) -> Self {
        Self(key.as_str().to_string())
    }

    /// Every per-table field listing of `table_id`.
    pub fn fields_of_table(table_id: &TableId) -> Self {
        Self::exact(&CacheKey::fields_by_table(table_id))
    }

    /// Every listing (collection read and pages) of `table_id`.
    pub fn record_listings_of_table(table_id: &TableId) -> Self {
        Self(format!(
            "record:list:{}:{}",
            escape_segment(table_id.as_str()),
            WILDCARD
        ))
    }

    /// Any key of `record_id` whatever its owning table.
    pub fn record_any_parent(record_id: &RecordId) -> Self {
        Self(format!(
            "record:{0}:{0}:{1}",
            WILDCARD,
            escape_segment(record_id.as_str())
        ))
    }

    /// Every record listing of every table.
    pub fn all_record_listings() -> Self {
        Self(format!("record:list:{}", WILDCARD))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the pattern contains no wildcard and names a single key.
    pub fn is_literal(&self) -> bool {
        !self.0.contains(WILDCARD)
    }

    /// Compile into an anchored regular expression.
    pub fn to_regex(&self) -> Result<Regex, CacheError> {
        let body = self
            .0
            .split(WILDCARD)
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        Regex::new(&format!("^{}$", body)).map_err(|e| CacheError::InvalidPattern {
            pattern: self.0.clone(),
            reason: e.to_string(),
        })
    }

    /// Match a single key. Prefer [`Self::to_regex`] when matching many keys.
    pub fn matches(&self, key: &str) -> bool {
        self.to_regex().map(|re| re.is_match(key)).unwrap_or(false)
    }
}

impl fmt::Display for InvalidationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
