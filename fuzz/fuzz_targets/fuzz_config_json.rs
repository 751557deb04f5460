//! Fuzz target for JSON configuration parsing and validation.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pw_config::{validate_config, ProcwardConfig};

fuzz_target!(|data: &str| {
    // Parse failures are errors; anything that parses must validate without panicking
    if let Ok(config) = ProcwardConfig::from_json_str(data) {
        let _ = validate_config(&config);
    }
});
