//! Fuzz test for cache invalidation patterns
//!
//! Feeds arbitrary globs and keys through pattern compilation and matching.
//! Compilation must never panic, and a glob without wildcards must match
//! exactly itself.
//!
//! Run with: cargo +nightly fuzz run pattern_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use tabula_storage::InvalidationPattern;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let (glob, key) = input.split_once('\n').unwrap_or((input, input));

    let pattern = InvalidationPattern::new(glob);
    // Only the compiled size limit can reject an escaped glob
    let Ok(regex) = pattern.to_regex() else {
        return;
    };

    // A pattern always matches its own text with every `*` removed
    let stripped = glob.replace('*', "");
    assert!(regex.is_match(&stripped), "pattern {glob:?} rejects {stripped:?}");

    if pattern.is_literal() {
        assert_eq!(regex.is_match(key), glob == key);
    }
    assert_eq!(pattern.matches(key), regex.is_match(key));
});
