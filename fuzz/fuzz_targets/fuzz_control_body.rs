//! Fuzz target for control file body parsing.

#![no_main]

use catalog_sync::bucket::ControlBody;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(body) = ControlBody::parse(s) {
            // Rendering and reparsing is stable.
            assert_eq!(ControlBody::parse(&body.render()).ok(), Some(body));
        }
    }
});
