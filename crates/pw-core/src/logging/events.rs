//! Structured event definitions for logging.
//!
//! Event names are stable strings; consumers filter JSONL output on them.

use serde::{Deserialize, Serialize};

/// Where in a procward run an event was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup and configuration.
    Init,
    /// Platform detection.
    Detect,
    /// Listings and lookups.
    Inspect,
    /// Signal delivery and verification.
    Kill,
    Health,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Detect => "detect",
            Stage::Inspect => "inspect",
            Stage::Kill => "kill",
            Stage::Health => "health",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in structured logs.
pub mod event_names {
    // Run lifecycle
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_FINISHED: &str = "run.finished";

    // Detection
    pub const DETECT_FINISHED: &str = "detect.finished";
    pub const PROVIDER_INITIALIZED: &str = "provider.initialized";

    // Kill operations
    pub const KILL_SUCCEEDED: &str = "kill.succeeded";
    pub const KILL_FAILED: &str = "kill.failed";
    pub const KILL_REJECTED: &str = "kill.rejected";

    // Batching
    pub const BATCH_FLUSHED: &str = "batch.flushed";

    // Health
    pub const HEALTH_CHECKED: &str = "health.checked";

    // Config
    pub const CONFIG_LOADED: &str = "config.loaded";
    pub const CONFIG_DEFAULT_USED: &str = "config.default_used";

    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Run-scoped identifiers attached to every `log_event!`.
#[derive(Debug, Clone)]
pub struct LogContext {
    pub run_id: String,
    pub host_id: String,
}

impl LogContext {
    pub fn new(run_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        LogContext {
            run_id: run_id.into(),
            host_id: host_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display_matches_serde() {
        for stage in [
            Stage::Init,
            Stage::Detect,
            Stage::Inspect,
            Stage::Kill,
            Stage::Health,
        ] {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{stage}\""));
        }
    }

    #[test]
    fn test_event_names_are_dotted_lowercase() {
        for name in [
            event_names::RUN_STARTED,
            event_names::DETECT_FINISHED,
            event_names::PROVIDER_INITIALIZED,
            event_names::HEALTH_CHECKED,
            event_names::CONFIG_DEFAULT_USED,
        ] {
            assert!(name.contains('.'), "{name}");
            assert_eq!(name, name.to_lowercase());
        }
    }
}
