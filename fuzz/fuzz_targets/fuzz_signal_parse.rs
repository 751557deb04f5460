//! Fuzz target for signal name and number parsing.
//!
//! Anything that parses must print back to something that parses to the
//! same signal.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pw_common::Signal;

fuzz_target!(|data: &str| {
    if let Ok(signal) = Signal::parse(data) {
        let reparsed = Signal::parse(&signal.to_string()).expect("display output must parse");
        assert_eq!(reparsed, signal);
    }
});
