//! Fuzz test for record snapshot patch application
//!
//! Decodes arbitrary bytes as JSON0 patch entries and applies them to a
//! fixed snapshot. Application must never panic, and a rejected patch must
//! leave the snapshot untouched.
//!
//! Run with: cargo +nightly fuzz run patch_apply_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::json;
use tabula_core::{FieldId, PatchEntry, RecordSnapshot};

fuzz_target!(|data: &[u8]| {
    let Ok(entries) = serde_json::from_slice::<Vec<PatchEntry>>(data) else {
        return;
    };

    let mut snapshot = RecordSnapshot::empty();
    snapshot.fields.insert(FieldId::new("a"), json!(1));
    snapshot.fields.insert(FieldId::new("b"), json!("text"));
    let before = snapshot.clone();

    match snapshot.apply(&entries) {
        Ok(()) => {
            assert!(snapshot.fields.values().all(|v| !v.is_null()));
        }
        Err(_) => assert_eq!(snapshot, before),
    }
});
