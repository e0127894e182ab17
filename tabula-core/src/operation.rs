//! Field-level patch operations.
//!
//! A field edit is expressed as a JSON0-style patch entry addressed by a
//! two-segment path: the field-data namespace followed by the field id.
//! Entries optionally carry the old value, which the sync primitive checks
//! against the live document before applying the change.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::{FieldId, Record, RecordId};

/// First path segment of every field patch.
pub const FIELD_DATA_NAMESPACE: &str = "fields";

/// Path locating a value inside a record document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpPath(Vec<String>);

impl OpPath {
    /// Path of a field value: `["fields", field_id]`.
    pub fn field(field_id: &FieldId) -> Self {
        Self(vec![
            FIELD_DATA_NAMESPACE.to_string(),
            field_id.as_str().to_string(),
        ])
    }

    /// Raw path segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// The field addressed by this path, if it is a field-data path.
    pub fn field_id(&self) -> Option<FieldId> {
        match self.0.as_slice() {
            [namespace, field] if namespace == FIELD_DATA_NAMESPACE && !field.is_empty() => {
                Some(FieldId::new(field.clone()))
            }
            _ => None,
        }
    }
}

/// Shape of a patch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Set a value without checking what is there.
    Insert,
    /// Remove a value, checking the old one.
    Delete,
    /// Swap the old value for a new one, checking the old one.
    Replace,
}

/// One path-addressed change. Serializes to `{"p": [...], "oi": .., "od": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchEntry {
    #[serde(rename = "p")]
    pub path: OpPath,
    #[serde(rename = "oi", default, skip_serializing_if = "Option::is_none")]
    pub insert: Option<Value>,
    #[serde(rename = "od", default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<Value>,
}

impl PatchEntry {
    /// Classify the entry. Entries with neither side are rejected by
    /// [`RecordSnapshot::apply`] and never built by the translator.
    pub fn kind(&self) -> Option<PatchKind> {
        match (&self.insert, &self.delete) {
            (Some(_), None) => Some(PatchKind::Insert),
            (None, Some(_)) => Some(PatchKind::Delete),
            (Some(_), Some(_)) => Some(PatchKind::Replace),
            (None, None) => None,
        }
    }
}

/// An ordered list of patch entries targeting one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub record_id: RecordId,
    pub entries: Vec<PatchEntry>,
}

impl Operation {
    /// An operation that changes nothing.
    pub fn empty(record_id: RecordId) -> Self {
        Self {
            record_id,
            entries: Vec::new(),
        }
    }

    /// True when no effective change is requested. Empty operations are
    /// never submitted.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn present(value: Option<Value>) -> Option<Value> {
    value.filter(|v| !v.is_null())
}

/// Translate a field value change into a minimal operation.
///
/// `null` counts as absent for both values.
///
/// | new     | old     | result                          |
/// |---------|---------|---------------------------------|
/// | absent  | absent  | empty operation                 |
/// | absent  | known   | delete carrying the old value   |
/// | present | known   | replace carrying old and new    |
/// | present | absent  | insert, no conflict check       |
pub fn build_field_update(
    record_id: &RecordId,
    field_id: &FieldId,
    new_value: Option<Value>,
    old_value: Option<Value>,
) -> Operation {
    let new_value = present(new_value);
    let old_value = present(old_value);

    if new_value.is_none() && old_value.is_none() {
        return Operation::empty(record_id.clone());
    }

    Operation {
        record_id: record_id.clone(),
        entries: vec![PatchEntry {
            path: OpPath::field(field_id),
            insert: new_value,
            delete: old_value,
        }],
    }
}

/// Reasons a patch cannot be applied to a snapshot.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PatchError {
    #[error("conflict on field {field_id}: expected {expected}, found {actual}")]
    Conflict {
        field_id: FieldId,
        expected: Value,
        actual: Value,
    },

    #[error("path {0:?} does not address a field value")]
    InvalidPath(Vec<String>),

    #[error("patch entry at {0:?} carries neither an insert nor a delete")]
    EmptyEntry(Vec<String>),
}

/// Document-shaped view of a record's field data, as carried by live events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    #[serde(default)]
    pub fields: BTreeMap<FieldId, Value>,
}

impl RecordSnapshot {
    /// Snapshot with no field data.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Project a stored record onto the document shape.
    pub fn from_record(record: &Record) -> Self {
        Self {
            fields: record.fields.clone(),
        }
    }

    pub fn get(&self, field_id: &FieldId) -> Option<&Value> {
        self.fields.get(field_id)
    }

    /// Apply entries in order with old-value checks. The snapshot is left
    /// untouched unless every entry applies.
    pub fn apply(&mut self, entries: &[PatchEntry]) -> Result<(), PatchError> {
        let mut next = self.fields.clone();
        for entry in entries {
            let field_id = entry
                .path
                .field_id()
                .ok_or_else(|| PatchError::InvalidPath(entry.path.segments().to_vec()))?;
            if entry.kind().is_none() {
                return Err(PatchError::EmptyEntry(entry.path.segments().to_vec()));
            }

            if let Some(expected) = &entry.delete {
                let actual = next.get(&field_id).cloned().unwrap_or(Value::Null);
                if &actual != expected {
                    return Err(PatchError::Conflict {
                        field_id,
                        expected: expected.clone(),
                        actual,
                    });
                }
            }

            match &entry.insert {
                Some(value) if !value.is_null() => {
                    next.insert(field_id, value.clone());
                }
                _ => {
                    next.remove(&field_id);
                }
            }
        }
        self.fields = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn rid() -> RecordId {
        RecordId::new("r1")
    }

    fn fid() -> FieldId {
        FieldId::new("f1")
    }

    #[test]
    fn test_absent_new_and_unknown_old_is_empty() {
        let op = build_field_update(&rid(), &fid(), None, None);
        assert!(op.is_empty());
        assert_eq!(op.record_id, rid());
    }

    #[test]
    fn test_absent_new_and_known_old_is_delete() {
        let op = build_field_update(&rid(), &fid(), None, Some(json!("x")));
        assert_eq!(op.len(), 1);
        let entry = &op.entries[0];
        assert_eq!(entry.kind(), Some(PatchKind::Delete));
        assert_eq!(entry.delete, Some(json!("x")));
        assert_eq!(entry.insert, None);
        assert_eq!(entry.path.segments(), ["fields", "f1"]);
    }

    #[test]
    fn test_present_new_and_known_old_is_replace() {
        let op = build_field_update(&rid(), &fid(), Some(json!(2)), Some(json!(1)));
        let entry = &op.entries[0];
        assert_eq!(entry.kind(), Some(PatchKind::Replace));
        assert_eq!(entry.insert, Some(json!(2)));
        assert_eq!(entry.delete, Some(json!(1)));
    }

    #[test]
    fn test_present_new_and_unknown_old_is_insert() {
        let op = build_field_update(&rid(), &fid(), Some(json!(2)), None);
        let entry = &op.entries[0];
        assert_eq!(entry.kind(), Some(PatchKind::Insert));
        assert_eq!(entry.delete, None);
    }

    #[test]
    fn test_null_counts_as_absent() {
        let op = build_field_update(&rid(), &fid(), Some(Value::Null), Some(Value::Null));
        assert!(op.is_empty());

        let op = build_field_update(&rid(), &fid(), Some(Value::Null), Some(json!(1)));
        assert_eq!(op.entries[0].kind(), Some(PatchKind::Delete));
    }

    #[test]
    fn test_wire_format_is_json0() {
        let op = build_field_update(&rid(), &fid(), Some(json!(2)), Some(json!(1)));
        let wire = serde_json::to_value(&op.entries[0]).unwrap();
        assert_eq!(wire, json!({"p": ["fields", "f1"], "oi": 2, "od": 1}));

        let insert = build_field_update(&rid(), &fid(), Some(json!("a")), None);
        let wire = serde_json::to_value(&insert.entries[0]).unwrap();
        assert_eq!(wire, json!({"p": ["fields", "f1"], "oi": "a"}));
    }

    #[test]
    fn test_apply_replace_checks_old_value() {
        let mut snap = RecordSnapshot::empty();
        snap.fields.insert(fid(), json!(1));

        let stale = build_field_update(&rid(), &fid(), Some(json!(3)), Some(json!(0)));
        let err = snap.apply(&stale.entries).unwrap_err();
        assert!(matches!(err, PatchError::Conflict { .. }));
        assert_eq!(snap.get(&fid()), Some(&json!(1)));

        let fresh = build_field_update(&rid(), &fid(), Some(json!(3)), Some(json!(1)));
        snap.apply(&fresh.entries).unwrap();
        assert_eq!(snap.get(&fid()), Some(&json!(3)));
    }

    #[test]
    fn test_apply_insert_overwrites_without_check() {
        let mut snap = RecordSnapshot::empty();
        snap.fields.insert(fid(), json!("old"));
        let op = build_field_update(&rid(), &fid(), Some(json!("new")), None);
        snap.apply(&op.entries).unwrap();
        assert_eq!(snap.get(&fid()), Some(&json!("new")));
    }

    #[test]
    fn test_apply_delete_removes_field() {
        let mut snap = RecordSnapshot::empty();
        snap.fields.insert(fid(), json!(true));
        let op = build_field_update(&rid(), &fid(), None, Some(json!(true)));
        snap.apply(&op.entries).unwrap();
        assert!(snap.get(&fid()).is_none());
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let mut snap = RecordSnapshot::empty();
        let good = PatchEntry {
            path: OpPath::field(&FieldId::new("a")),
            insert: Some(json!(1)),
            delete: None,
        };
        let bad = PatchEntry {
            path: OpPath::field(&FieldId::new("b")),
            insert: Some(json!(2)),
            delete: Some(json!("missing")),
        };
        assert!(snap.apply(&[good, bad]).is_err());
        assert!(snap.fields.is_empty());
    }

    #[test]
    fn test_apply_rejects_foreign_paths() {
        let mut snap = RecordSnapshot::empty();
        let entry = PatchEntry {
            path: OpPath(vec!["meta".to_string(), "x".to_string()]),
            insert: Some(json!(1)),
            delete: None,
        };
        assert!(matches!(
            snap.apply(&[entry]),
            Err(PatchError::InvalidPath(_))
        ));
    }

    fn arb_value() -> impl Strategy<Value = Option<Value>> {
        prop_oneof![
            Just(None),
            Just(Some(Value::Null)),
            any::<i64>().prop_map(|n| Some(json!(n))),
            "[a-z]{0,8}".prop_map(|s| Some(json!(s))),
            any::<bool>().prop_map(|b| Some(json!(b))),
        ]
    }

    proptest! {
        #[test]
        fn prop_empty_iff_both_absent(new in arb_value(), old in arb_value()) {
            let new_present = new.as_ref().is_some_and(|v| !v.is_null());
            let old_present = old.as_ref().is_some_and(|v| !v.is_null());
            let op = build_field_update(&rid(), &fid(), new.clone(), old.clone());

            prop_assert_eq!(op.is_empty(), !new_present && !old_present);
            if !op.is_empty() {
                prop_assert_eq!(op.len(), 1);
                let entry = &op.entries[0];
                prop_assert_eq!(entry.insert.is_some(), new_present);
                prop_assert_eq!(entry.delete.is_some(), old_present);
                prop_assert_eq!(entry.path.field_id(), Some(fid()));
            }
        }

        #[test]
        fn prop_update_against_matching_old_value_applies(
            old in arb_value(),
            new in arb_value(),
        ) {
            let mut snap = RecordSnapshot::empty();
            if let Some(v) = old.clone().filter(|v| !v.is_null()) {
                snap.fields.insert(fid(), v);
            }
            let op = build_field_update(&rid(), &fid(), new.clone(), old);
            prop_assert!(snap.apply(&op.entries).is_ok());
            let expected = new.filter(|v| !v.is_null());
            prop_assert_eq!(snap.get(&fid()).cloned(), expected);
        }
    }
}
