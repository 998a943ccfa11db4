//! Fuzz target for entry ID and DN parsing.
//!
//! Neither parser may panic, and DN normalization must be idempotent.

#![no_main]

use directory_replicator::event::normalize_dn;
use directory_replicator::feed::redis::parse_change_id;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (id, dn) = data;

    if let Some(seq) = parse_change_id(id) {
        assert_eq!(parse_change_id(&format!("{seq}-0")), Some(seq));
    }

    if let Ok(normalized) = normalize_dn(dn) {
        assert_eq!(normalize_dn(&normalized).as_deref(), Ok(normalized.as_str()));
    }
});
