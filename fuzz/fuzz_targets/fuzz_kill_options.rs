//! Fuzz target for kill request validation.
//!
//! Pids, name patterns and service names arrive from the command line; the
//! validators must reject bad input with an error, never a panic.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pw_common::OsFamily;
use pw_core::provider::{compile_matcher, validate_pid, validate_service_name, MatchMode};

#[derive(Debug, Arbitrary)]
struct Input {
    pid: u64,
    windows: bool,
    regex: bool,
    pattern: String,
}

fuzz_target!(|input: Input| {
    let family = if input.windows {
        OsFamily::Windows
    } else {
        OsFamily::Unix
    };
    if let Ok(pid) = validate_pid(input.pid, family) {
        assert!(pid > 0);
        assert!(u64::from(pid) <= family.max_pid());
    }

    let mode = if input.regex {
        MatchMode::Regex
    } else {
        MatchMode::Exact
    };
    let _ = compile_matcher(&input.pattern, mode);
    let _ = validate_service_name(&input.pattern);
});
