//! Fuzz target for `wmic process get ... /format:csv` parsing.
//!
//! Command lines may contain commas, so the parser splits from the right.

#![no_main]

use chrono::Utc;
use libfuzzer_sys::fuzz_target;
use pw_core::collect::windows::parse_wmic_csv;

fuzz_target!(|data: &str| {
    let _ = parse_wmic_csv(data, Utc::now());
});
