//! Fuzz target for control metadata extraction.
//!
//! Arbitrary JSON metadata must yield an event or a malformed error,
//! never a panic.

#![no_main]

use directory_replicator::event::extract_change_control;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(serde_json::Value::Object(metadata)) = serde_json::from_slice(data) {
        let _ = extract_change_control(&metadata);
    }
});
