//! Fuzz target for TOML configuration parsing and validation.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pw_config::{validate_config, ProcwardConfig};

fuzz_target!(|data: &str| {
    if let Ok(config) = ProcwardConfig::from_toml_str(data) {
        let _ = validate_config(&config);
    }
});
