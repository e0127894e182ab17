//! Collection-key derivation for the document sync primitive.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::TableId;

/// Default prefix prepended to a table id to form its collection key.
pub const DEFAULT_COLLECTION_PREFIX: &str = "rec_";

/// Name of the sync collection holding a table's record documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionKey(String);

impl CollectionKey {
    /// `prefix` followed by the table id.
    pub fn for_table(prefix: &str, table_id: &TableId) -> Self {
        Self(format!("{}{}", prefix, table_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the table id given the prefix the key was built with.
    pub fn table_id(&self, prefix: &str) -> Option<TableId> {
        self.0
            .strip_prefix(prefix)
            .filter(|rest| !rest.is_empty())
            .map(TableId::new)
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
