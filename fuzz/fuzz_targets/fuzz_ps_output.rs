//! Fuzz target for `ps` listing parsing.
//!
//! Every row either parses or is counted as skipped; nothing panics.

#![no_main]

use chrono::Utc;
use libfuzzer_sys::fuzz_target;
use pw_core::collect::ps::{parse_linkage, parse_ps_output};

fuzz_target!(|data: &str| {
    let listing = parse_ps_output(data, Utc::now());
    assert!(listing.records.len() + listing.skipped <= data.lines().count());
    let _ = parse_linkage(data);
});
