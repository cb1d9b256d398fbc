//! Fuzz target for timestamp parsing.
//!
//! Tests that parsing never panics and that formatting is a fixed point
//! once a timestamp has been through it (microsecond precision).

#![no_main]

use article_sync::event::{format_timestamp, parse_timestamp};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: &str| {
    if let Ok(dt) = parse_timestamp(input) {
        let formatted = format_timestamp(&dt);
        let reparsed = parse_timestamp(&formatted).expect("formatted timestamp reparses");
        assert_eq!(format_timestamp(&reparsed), formatted);
    }
});
