//! Fuzz target for control file name parsing.
//!
//! Parsing never panics, and a parsed name survives a render/parse cycle.

#![no_main]

use catalog_sync::bucket::ControlName;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(name) = ControlName::parse(data) {
        let rendered = name.file_name();
        assert_eq!(ControlName::parse(&rendered).ok(), Some(name));
    }
});
