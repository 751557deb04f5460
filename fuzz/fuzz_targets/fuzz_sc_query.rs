//! Fuzz target for `sc queryex` output parsing.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pw_core::collect::windows::{parse_sc_pid, parse_sc_state};

fuzz_target!(|data: &str| {
    let _ = parse_sc_state(data);
    let _ = parse_sc_pid(data);
});
