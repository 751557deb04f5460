//! Detection snapshot types.

use chrono::{DateTime, Utc};
use pw_common::{OsFamily, ProviderKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capability flag names. These are the keys of [`PlatformInfo::capabilities`].
pub mod caps {
    pub const LIST_PROCESSES: &str = "listProcesses";
    pub const GET_PROCESS_INFO: &str = "getProcessInfo";
    pub const KILL_BY_PID: &str = "killByPid";
    pub const KILL_BY_NAME: &str = "killByName";
    pub const KILL_PROCESS_TREE: &str = "killProcessTree";
    pub const PROCESS_GROUP_KILL: &str = "processGroupKill";
    pub const ADVANCED_PROCESS_CONTROL: &str = "advancedProcessControl";
    pub const PATTERN_MATCHING: &str = "patternMatching";
    pub const KILL_SERVICE: &str = "killService";
    pub const NETWORK_INSPECTION: &str = "networkInspection";
    pub const OPEN_FILE_INSPECTION: &str = "openFileInspection";
    pub const KILL_ALL: &str = "killAll";
    pub const SEND_SIGNAL: &str = "sendSignal";
}

/// OS version string and the probe that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsVersion {
    pub version: String,
    /// Command or file that produced the version, or `runtime`.
    pub source: String,
}

/// CPU facts from the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub logical_cores: usize,
    pub brand: Option<String>,
}

/// Availability of one native tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Whether the tool was located.
    pub available: bool,

    /// Resolved path.
    pub path: Option<String>,

    /// Best-effort version string.
    pub version: Option<String>,

    /// Probe error, when location itself failed for a reason other than absence.
    pub error: Option<String>,
}

impl ToolInfo {
    /// Create an entry for an unavailable tool.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            path: None,
            version: None,
            error: None,
        }
    }

    /// Create an entry for a tool whose probe failed.
    pub fn probe_failed(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::unavailable()
        }
    }

    /// Create an entry for a located tool.
    pub fn found(path: String, version: Option<String>) -> Self {
        Self {
            available: true,
            path: Some(path),
            version,
            error: None,
        }
    }
}

/// Latency and reliability of one micro-benchmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkStats {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// successes / attempts; timeouts count as failures.
    pub reliability: f64,
    pub iterations: u32,
}

/// Advice derived from benchmark numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationHint {
    /// Operation the hint is about (`process_lookup`, `network_listing`, ...).
    pub operation: String,
    /// Tool to prefer.
    pub prefer: String,
    pub reason: String,
}

/// Immutable platform snapshot produced by detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// OS identifier (`linux`, `macos`, `windows`, ...).
    pub platform: String,
    pub family: OsFamily,
    pub os_version: OsVersion,
    pub arch: String,
    pub cpu: CpuInfo,
    pub shells: Vec<String>,
    pub tools: BTreeMap<String, ToolInfo>,
    pub capabilities: BTreeMap<String, bool>,
    pub performance: BTreeMap<String, BenchmarkStats>,
    pub hints: Vec<OptimizationHint>,
    /// Weighted score in [0, 1].
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

impl PlatformInfo {
    /// Look up a capability flag; unknown names are unsupported.
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.get(capability).copied().unwrap_or(false)
    }

    /// Whether a tool was located.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.available)
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.family.provider_kind()
    }

    /// Hinted tool for an operation, if any.
    pub fn preferred_tool(&self, operation: &str) -> Option<&str> {
        self.hints
            .iter()
            .find(|h| h.operation == operation)
            .map(|h| h.prefer.as_str())
    }

    /// Number of capability flags that are true.
    pub fn available_capability_count(&self) -> usize {
        self.capabilities.values().filter(|v| **v).count()
    }
}
