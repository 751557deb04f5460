//! Typed configuration sections.
//!
//! Every duration is stored in milliseconds so files stay readable in both
//! JSON and TOML; accessor methods hand out [`Duration`]s.

use crate::validate::{ConfigError, ConfigResult};
use pw_common::OsFamily;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcwardConfig {
    pub runner: RunnerSettings,
    pub detector: DetectorSettings,
    pub unix: KillSettings,
    /// Missing keys fall back to the Windows defaults, not the Unix ones.
    #[serde(deserialize_with = "deserialize_windows_kill")]
    pub windows: KillSettings,
    pub facade: FacadeSettings,
    pub optimizer: OptimizerSettings,
}

impl Default for ProcwardConfig {
    fn default() -> Self {
        Self {
            runner: RunnerSettings::default(),
            detector: DetectorSettings::default(),
            unix: KillSettings::unix_defaults(),
            windows: KillSettings::windows_defaults(),
            facade: FacadeSettings::default(),
            optimizer: OptimizerSettings::default(),
        }
    }
}

impl ProcwardConfig {
    /// Load from a file, choosing the parser by extension (`.toml` or JSON).
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::IoError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            _ => Self::from_json_str(&content),
        }
    }

    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| ConfigError::ParseError(format!("Invalid JSON: {}", e)))
    }

    /// Parse from a TOML string.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|e| ConfigError::ParseError(format!("Invalid TOML: {}", e)))
    }

    /// Kill settings for the given platform family.
    pub fn kill_settings(&self, family: OsFamily) -> &KillSettings {
        match family {
            OsFamily::Unix => &self.unix,
            OsFamily::Windows => &self.windows,
        }
    }
}

/// Native command execution limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Per-invocation timeout.
    pub command_timeout_ms: u64,
    /// Captured stdout/stderr are truncated past this size.
    pub max_output_bytes: usize,
    /// When set, only these program names may be executed.
    pub allowlist: Option<Vec<String>>,
    /// Clear the child environment except `PATH` and a C locale.
    pub sanitize_env: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            max_output_bytes: 4 * 1024 * 1024,
            allowlist: None,
            sanitize_env: true,
        }
    }
}

impl RunnerSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Platform detection behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// How long a detection snapshot stays valid.
    pub cache_ttl_ms: u64,
    /// Spawn a throwaway child to verify process-group kill. When off,
    /// `processGroupKill` is reported false.
    pub probe_process_group: bool,
    pub run_benchmarks: bool,
    pub benchmark_iterations: u32,
    pub shell_probe_timeout_ms: u64,
    pub tool_probe_timeout_ms: u64,
    pub benchmark_timeout_ms: u64,
    /// Weight of the required-tool fraction in the confidence score.
    pub confidence_tool_weight: f64,
    /// Weight of the capability fraction in the confidence score.
    pub confidence_capability_weight: f64,
    /// Process listing slower than this recommends the alternate lookup tool.
    pub slow_listing_threshold_ms: f64,
    /// Benchmarks with reliability below this recommend the alternate tool.
    pub min_reliability: f64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 5 * 60 * 1000,
            probe_process_group: true,
            run_benchmarks: true,
            benchmark_iterations: 3,
            shell_probe_timeout_ms: 2_000,
            tool_probe_timeout_ms: 3_000,
            benchmark_timeout_ms: 5_000,
            confidence_tool_weight: 0.6,
            confidence_capability_weight: 0.4,
            slow_listing_threshold_ms: 500.0,
            min_reliability: 0.8,
        }
    }
}

impl DetectorSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn shell_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.shell_probe_timeout_ms)
    }

    pub fn tool_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_probe_timeout_ms)
    }

    pub fn benchmark_timeout(&self) -> Duration {
        Duration::from_millis(self.benchmark_timeout_ms)
    }
}

/// Termination tuning for one platform family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSettings {
    /// Delay between escalation steps.
    pub escalation_delay_ms: u64,
    /// Pids killed per batch by kill-by-name.
    pub batch_size: usize,
    /// Pause between sequential batches.
    pub batch_pause_ms: u64,
    /// Interval between existence polls.
    pub poll_interval_ms: u64,
    /// Wait for the most forceful kill to take effect.
    pub verify_timeout_ms: u64,
    /// Default post-kill wait when the caller gives no timeout.
    pub default_timeout_ms: u64,
    /// Upper bound on matches for kill-by-name when the caller sets none.
    pub default_max_matches: Option<usize>,
}

impl KillSettings {
    /// Defaults tuned for Unix signal delivery.
    pub fn unix_defaults() -> Self {
        Self {
            escalation_delay_ms: 1_000,
            batch_size: 50,
            batch_pause_ms: 100,
            poll_interval_ms: 100,
            verify_timeout_ms: 5_000,
            default_timeout_ms: 5_000,
            default_max_matches: None,
        }
    }

    /// Defaults tuned for `taskkill`, which is slower to start.
    pub fn windows_defaults() -> Self {
        Self {
            escalation_delay_ms: 2_000,
            batch_size: 20,
            ..Self::unix_defaults()
        }
    }

    pub fn escalation_delay(&self) -> Duration {
        Duration::from_millis(self.escalation_delay_ms)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for KillSettings {
    fn default() -> Self {
        Self::unix_defaults()
    }
}

/// Sparse form of [`KillSettings`] used to overlay a file section on
/// platform-specific defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KillSettingsPatch {
    escalation_delay_ms: Option<u64>,
    batch_size: Option<usize>,
    batch_pause_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    verify_timeout_ms: Option<u64>,
    default_timeout_ms: Option<u64>,
    default_max_matches: Option<usize>,
}

impl KillSettingsPatch {
    fn apply(self, mut base: KillSettings) -> KillSettings {
        if let Some(v) = self.escalation_delay_ms {
            base.escalation_delay_ms = v;
        }
        if let Some(v) = self.batch_size {
            base.batch_size = v;
        }
        if let Some(v) = self.batch_pause_ms {
            base.batch_pause_ms = v;
        }
        if let Some(v) = self.poll_interval_ms {
            base.poll_interval_ms = v;
        }
        if let Some(v) = self.verify_timeout_ms {
            base.verify_timeout_ms = v;
        }
        if let Some(v) = self.default_timeout_ms {
            base.default_timeout_ms = v;
        }
        if self.default_max_matches.is_some() {
            base.default_max_matches = self.default_max_matches;
        }
        base
    }
}

fn deserialize_windows_kill<'de, D>(deserializer: D) -> Result<KillSettings, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let patch = KillSettingsPatch::deserialize(deserializer)?;
    Ok(patch.apply(KillSettings::windows_defaults()))
}

/// Facade read cache and health thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FacadeSettings {
    pub cache_enabled: bool,
    pub read_cache_ttl_ms: u64,
    /// Unhealthy above this fraction of failed calls.
    pub max_error_rate: f64,
    /// Unhealthy above this average latency.
    pub max_avg_latency_ms: f64,
}

impl Default for FacadeSettings {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            read_cache_ttl_ms: 2_000,
            max_error_rate: 0.10,
            max_avg_latency_ms: 3_000.0,
        }
    }
}

impl FacadeSettings {
    pub fn read_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.read_cache_ttl_ms)
    }
}

/// Optimization engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub enabled: bool,
    /// Strategy names to leave disabled at startup.
    pub disabled_strategies: Vec<String>,
    /// Rolling history length per operation kind.
    pub history_size: usize,
    /// Window during which same-shaped kills are grouped.
    pub batch_window_ms: u64,
    pub cache_ttl_fast_ms: u64,
    pub cache_ttl_medium_ms: u64,
    pub cache_ttl_slow_ms: u64,
    /// Average latency above which results use the medium TTL.
    pub ttl_medium_threshold_ms: f64,
    /// Average latency above which results use the slow TTL.
    pub ttl_slow_threshold_ms: f64,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// Resource pressure (0..1) treated as high.
    pub high_pressure: f64,
    /// Resource pressure (0..1) treated as low.
    pub low_pressure: f64,
    pub max_timeout_ms: u64,
    pub recommend_latency_ms: f64,
    pub recommend_min_success_rate: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled_strategies: Vec::new(),
            history_size: 100,
            batch_window_ms: 50,
            cache_ttl_fast_ms: 5_000,
            cache_ttl_medium_ms: 10_000,
            cache_ttl_slow_ms: 30_000,
            ttl_medium_threshold_ms: 200.0,
            ttl_slow_threshold_ms: 1_000.0,
            min_batch_size: 5,
            max_batch_size: 200,
            high_pressure: 0.8,
            low_pressure: 0.3,
            max_timeout_ms: 60_000,
            recommend_latency_ms: 2_000.0,
            recommend_min_success_rate: 0.9,
        }
    }
}

impl OptimizerSettings {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Cache TTL for an operation whose recent average latency is `avg_ms`.
    pub fn adaptive_ttl(&self, avg_ms: f64) -> Duration {
        let ms = if avg_ms > self.ttl_slow_threshold_ms {
            self.cache_ttl_slow_ms
        } else if avg_ms > self.ttl_medium_threshold_ms {
            self.cache_ttl_medium_ms
        } else {
            self.cache_ttl_fast_ms
        };
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_defaults_differ() {
        let config = ProcwardConfig::default();
        assert_eq!(config.kill_settings(OsFamily::Unix).escalation_delay_ms, 1_000);
        assert_eq!(config.kill_settings(OsFamily::Windows).escalation_delay_ms, 2_000);
        assert_eq!(config.kill_settings(OsFamily::Windows).batch_size, 20);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config =
            ProcwardConfig::from_json_str(r#"{"unix": {"batch_size": 10}}"#).unwrap();
        assert_eq!(config.unix.batch_size, 10);
        assert_eq!(config.unix.escalation_delay_ms, 1_000);
        assert_eq!(config.runner, RunnerSettings::default());
    }

    #[test]
    fn test_partial_windows_section_keeps_windows_defaults() {
        let config =
            ProcwardConfig::from_json_str(r#"{"windows": {"batch_pause_ms": 250}}"#).unwrap();
        assert_eq!(config.windows.batch_pause_ms, 250);
        assert_eq!(config.windows.escalation_delay_ms, 2_000);
        assert_eq!(config.windows.batch_size, 20);
    }

    #[test]
    fn test_toml_parses() {
        let config = ProcwardConfig::from_toml_str(
            "[detector]\nprobe_process_group = false\n\n[optimizer]\nhistory_size = 10\n",
        )
        .unwrap();
        assert!(!config.detector.probe_process_group);
        assert_eq!(config.optimizer.history_size, 10);
    }

    #[test]
    fn test_adaptive_ttl_thresholds() {
        let settings = OptimizerSettings::default();
        assert_eq!(settings.adaptive_ttl(50.0), Duration::from_secs(5));
        assert_eq!(settings.adaptive_ttl(500.0), Duration::from_secs(10));
        assert_eq!(settings.adaptive_ttl(1_500.0), Duration::from_secs(30));
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        let err = ProcwardConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
