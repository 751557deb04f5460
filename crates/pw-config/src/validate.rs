//! Configuration errors and semantic validation.

use crate::settings::{DetectorSettings, KillSettings, OptimizerSettings, ProcwardConfig};
use thiserror::Error;

/// Configuration result type.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Semantic validation failed: {0}")]
    SemanticError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ConfigError::IoError(_) => 43,
            ConfigError::ParseError(_) => 44,
            ConfigError::SemanticError(_) => 45,
            ConfigError::InvalidValue { .. } => 46,
        }
    }
}

impl From<ConfigError> for pw_common::Error {
    fn from(err: ConfigError) -> Self {
        pw_common::Error::Config(err.to_string())
    }
}

/// Validate a loaded configuration semantically.
pub fn validate_config(config: &ProcwardConfig) -> ConfigResult<()> {
    if config.runner.command_timeout_ms == 0 {
        return Err(invalid("runner.command_timeout_ms", "Must be positive, got 0"));
    }
    if config.runner.max_output_bytes == 0 {
        return Err(invalid("runner.max_output_bytes", "Must be positive, got 0"));
    }
    if let Some(allowlist) = &config.runner.allowlist {
        if allowlist.iter().any(|name| name.trim().is_empty()) {
            return Err(invalid("runner.allowlist", "Entries must be non-empty"));
        }
    }

    validate_detector(&config.detector)?;
    validate_kill("unix", &config.unix)?;
    validate_kill("windows", &config.windows)?;

    let facade = &config.facade;
    if facade.cache_enabled && facade.read_cache_ttl_ms == 0 {
        return Err(invalid(
            "facade.read_cache_ttl_ms",
            "Must be positive when the cache is enabled",
        ));
    }
    check_fraction("facade.max_error_rate", facade.max_error_rate)?;
    if facade.max_avg_latency_ms <= 0.0 {
        return Err(invalid(
            "facade.max_avg_latency_ms",
            format!("Must be positive, got {}", facade.max_avg_latency_ms),
        ));
    }

    validate_optimizer(&config.optimizer)
}

fn validate_detector(detector: &DetectorSettings) -> ConfigResult<()> {
    if detector.cache_ttl_ms == 0 {
        return Err(invalid("detector.cache_ttl_ms", "Must be positive, got 0"));
    }
    if detector.run_benchmarks && detector.benchmark_iterations == 0 {
        return Err(invalid(
            "detector.benchmark_iterations",
            "Must be positive when benchmarks run",
        ));
    }
    check_fraction("detector.confidence_tool_weight", detector.confidence_tool_weight)?;
    check_fraction(
        "detector.confidence_capability_weight",
        detector.confidence_capability_weight,
    )?;

    let sum = detector.confidence_tool_weight + detector.confidence_capability_weight;
    if (sum - 1.0).abs() > 0.001 {
        return Err(ConfigError::SemanticError(format!(
            "Confidence weights must sum to 1.0, got {} (tools={}, capabilities={})",
            sum, detector.confidence_tool_weight, detector.confidence_capability_weight,
        )));
    }

    check_fraction("detector.min_reliability", detector.min_reliability)
}

fn validate_kill(section: &str, kill: &KillSettings) -> ConfigResult<()> {
    if kill.batch_size == 0 {
        return Err(invalid(
            &format!("{section}.batch_size"),
            "Must be positive, got 0",
        ));
    }
    if kill.poll_interval_ms == 0 {
        return Err(invalid(
            &format!("{section}.poll_interval_ms"),
            "Must be positive, got 0",
        ));
    }
    if kill.poll_interval_ms > kill.verify_timeout_ms {
        return Err(ConfigError::SemanticError(format!(
            "{section}.poll_interval_ms ({}) exceeds {section}.verify_timeout_ms ({})",
            kill.poll_interval_ms, kill.verify_timeout_ms,
        )));
    }
    if kill.default_max_matches == Some(0) {
        return Err(invalid(
            &format!("{section}.default_max_matches"),
            "Must be positive when set",
        ));
    }
    Ok(())
}

fn validate_optimizer(optimizer: &OptimizerSettings) -> ConfigResult<()> {
    if optimizer.history_size == 0 {
        return Err(invalid("optimizer.history_size", "Must be positive, got 0"));
    }
    if optimizer.min_batch_size == 0 {
        return Err(invalid("optimizer.min_batch_size", "Must be positive, got 0"));
    }
    if optimizer.min_batch_size > optimizer.max_batch_size {
        return Err(ConfigError::SemanticError(format!(
            "optimizer.min_batch_size ({}) exceeds optimizer.max_batch_size ({})",
            optimizer.min_batch_size, optimizer.max_batch_size,
        )));
    }
    if optimizer.ttl_medium_threshold_ms > optimizer.ttl_slow_threshold_ms {
        return Err(ConfigError::SemanticError(format!(
            "optimizer.ttl_medium_threshold_ms ({}) exceeds optimizer.ttl_slow_threshold_ms ({})",
            optimizer.ttl_medium_threshold_ms, optimizer.ttl_slow_threshold_ms,
        )));
    }
    if optimizer.cache_ttl_fast_ms == 0 {
        return Err(invalid("optimizer.cache_ttl_fast_ms", "Must be positive, got 0"));
    }
    check_fraction("optimizer.high_pressure", optimizer.high_pressure)?;
    check_fraction("optimizer.low_pressure", optimizer.low_pressure)?;
    if optimizer.low_pressure >= optimizer.high_pressure {
        return Err(ConfigError::SemanticError(format!(
            "optimizer.low_pressure ({}) must be below optimizer.high_pressure ({})",
            optimizer.low_pressure, optimizer.high_pressure,
        )));
    }
    check_fraction(
        "optimizer.recommend_min_success_rate",
        optimizer.recommend_min_success_rate,
    )
}

fn check_fraction(field: &str, value: f64) -> ConfigResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(field, format!("Must be in [0, 1], got {}", value)));
    }
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        validate_config(&ProcwardConfig::default()).unwrap();
    }

    #[test]
    fn test_zero_batch_rejected() {
        let mut config = ProcwardConfig::default();
        config.windows.batch_size = 0;
        let err = validate_config(&config).unwrap_err();
        match err {
            ConfigError::InvalidValue { field, .. } => assert_eq!(field, "windows.batch_size"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = ProcwardConfig::default();
        config.detector.confidence_tool_weight = 0.5;
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::SemanticError(_)));
    }

    #[test]
    fn test_floor_above_ceiling_rejected() {
        let mut config = ProcwardConfig::default();
        config.optimizer.min_batch_size = 500;
        assert!(matches!(
            validate_config(&config).unwrap_err(),
            ConfigError::SemanticError(_)
        ));
    }

    #[test]
    fn test_zero_ttl_only_matters_when_cache_enabled() {
        let mut config = ProcwardConfig::default();
        config.facade.read_cache_ttl_ms = 0;
        assert!(validate_config(&config).is_err());
        config.facade.cache_enabled = false;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_converts_to_common_error() {
        let err: pw_common::Error = ConfigError::ParseError("bad".into()).into();
        assert_eq!(err.code(), 40);
    }
}
