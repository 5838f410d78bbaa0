//! Fuzz target for artifact decompression.
//!
//! `decompress` must return an error, never panic, on arbitrary bytes.

#![no_main]

use catalog_sync::bucket::packager::decompress;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = decompress(data);
});
