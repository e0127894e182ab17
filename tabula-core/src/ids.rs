//! Identity types for tabula entities.
//!
//! Table, record and field identifiers are opaque strings owned by the
//! authoritative store. Generated identifiers are a short kind prefix followed
//! by the simple form of a UUIDv7, so they sort by creation time within a kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ValidationError;

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

macro_rules! define_string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix used for generated identifiers of this kind.
            pub const PREFIX: &'static str = $prefix;

            /// Wrap an existing identifier.
            ///
            /// Identifiers coming from the store are trusted; use
            /// [`Self::parse`] for untrusted input.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Validate and wrap an identifier from untrusted input.
            pub fn parse(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.is_empty() {
                    return Err(ValidationError::InvalidIdentifier {
                        kind: stringify!($name).to_string(),
                        value: id,
                        reason: "identifier cannot be empty".to_string(),
                    });
                }
                // ':' separates cache key segments and '*' is the pattern wildcard.
                if id.contains(':') || id.contains('*') || id.chars().any(char::is_whitespace) {
                    return Err(ValidationError::InvalidIdentifier {
                        kind: stringify!($name).to_string(),
                        value: id,
                        reason: "identifier cannot contain ':', '*' or whitespace".to_string(),
                    });
                }
                Ok(Self(id))
            }

            /// Generate a fresh, timestamp-sortable identifier.
            pub fn generate() -> Self {
                Self(format!("{}{}", $prefix, Uuid::now_v7().simple()))
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume the wrapper and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// Identifier of a table. Records and fields belong to exactly one table.
    TableId,
    "tbl"
);

define_string_id!(
    /// Identifier of a record within a table.
    RecordId,
    "rec"
);

define_string_id!(
    /// Identifier of a field definition within a table.
    FieldId,
    "fld"
);

/// Identifier of an open write transaction in the authoritative store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Create a new transaction id (UUIDv7).
    pub fn now_v7() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
