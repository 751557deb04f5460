//! Fuzz target for `tasklist /FO CSV` parsing.

#![no_main]

use chrono::Utc;
use libfuzzer_sys::fuzz_target;
use pw_core::collect::windows::{parse_mem_usage, parse_tasklist_csv, split_csv_line, tasklist_pids};

fuzz_target!(|data: &str| {
    let _ = parse_tasklist_csv(data, Utc::now());
    let _ = tasklist_pids(data);
    for line in data.lines() {
        let _ = split_csv_line(line);
        let _ = parse_mem_usage(line);
    }
});
