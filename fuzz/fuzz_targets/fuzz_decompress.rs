//! Fuzz target for change payload decoding.
//!
//! `maybe_decompress` must never panic, and anything it accepts without
//! the zstd magic comes back unchanged.

#![no_main]

use directory_replicator::feed::redis::maybe_decompress;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(out) = maybe_decompress(data) {
        if !data.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
            assert_eq!(out, data);
        }
    }
});
