//! Platform detection.
//!
//! [`PlatformDetector`] builds an immutable [`PlatformInfo`] snapshot: OS
//! family and version, CPU facts, shells, native tools, capability flags,
//! micro-benchmarks and the hints derived from them. Every step except OS
//! classification is failure-isolated, so a missing tool or a hanging probe
//! degrades the snapshot instead of failing detection.
//!
//! Snapshots are cached for `detector.cache_ttl_ms` and replaced wholesale
//! on refresh.

pub mod benchmark;
pub mod capabilities;
pub mod platform;
pub mod probe;
pub mod tools;

pub use capabilities::{compute_confidence, confidence_for, derive_capabilities, required_tools};
pub use platform::{
    caps, BenchmarkStats, CpuInfo, OptimizationHint, OsVersion, PlatformInfo, ToolInfo,
};

use crate::collect::tool_runner::CommandRunner;
use crate::logging::events::event_names;
use pw_common::{OsFamily, ProviderKind};
use pw_config::DetectorSettings;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors that stop detection outright.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
}

impl From<DetectionError> for pw_common::Error {
    fn from(err: DetectionError) -> Self {
        pw_common::Error::Detection(err.to_string())
    }
}

#[derive(Debug, Clone)]
struct CachedInfo {
    at: Instant,
    info: Arc<PlatformInfo>,
}

/// Detects host facts and caches the resulting snapshot.
#[derive(Debug)]
pub struct PlatformDetector {
    runner: Arc<dyn CommandRunner>,
    settings: DetectorSettings,
    platform: String,
    cache: RwLock<Option<CachedInfo>>,
    /// Serializes detection runs so concurrent callers share one result.
    gate: tokio::sync::Mutex<()>,
}

impl PlatformDetector {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: DetectorSettings) -> Self {
        Self {
            runner,
            settings,
            platform: std::env::consts::OS.to_string(),
            cache: RwLock::new(None),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Detect as if running on `platform` (an OS identifier such as `linux`).
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    /// Return the cached snapshot, detecting when absent, expired, or forced.
    pub async fn detect(&self, force_refresh: bool) -> Result<Arc<PlatformInfo>, DetectionError> {
        if !force_refresh {
            if let Some(info) = self.fresh() {
                return Ok(info);
            }
        }

        let _guard = self.gate.lock().await;
        // Another caller may have finished while we waited
        if !force_refresh {
            if let Some(info) = self.fresh() {
                return Ok(info);
            }
        }

        let info = Arc::new(self.run_detection().await?);
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        *cache = Some(CachedInfo {
            at: Instant::now(),
            info: Arc::clone(&info),
        });
        Ok(info)
    }

    /// Peek at the cached snapshot without detecting. Expired entries are
    /// still returned.
    pub fn cached(&self) -> Option<Arc<PlatformInfo>> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.as_ref().map(|c| Arc::clone(&c.info))
    }

    /// Drop the cached snapshot.
    pub fn invalidate(&self) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        *cache = None;
    }

    /// Whether a capability flag is set, detecting lazily.
    pub async fn supports_feature(&self, capability: &str) -> Result<bool, DetectionError> {
        Ok(self.detect(false).await?.supports(capability))
    }

    /// Provider kind for this host. Needs only OS classification.
    pub fn recommended_provider(&self) -> Result<ProviderKind, DetectionError> {
        self.family().map(|f| f.provider_kind())
    }

    fn family(&self) -> Result<OsFamily, DetectionError> {
        OsFamily::classify(&self.platform)
            .ok_or_else(|| DetectionError::UnknownPlatform(self.platform.clone()))
    }

    fn fresh(&self) -> Option<Arc<PlatformInfo>> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache
            .as_ref()
            .filter(|c| c.at.elapsed() < self.settings.cache_ttl())
            .map(|c| Arc::clone(&c.info))
    }

    #[instrument(skip(self), fields(platform = %self.platform))]
    async fn run_detection(&self) -> Result<PlatformInfo, DetectionError> {
        let started = Instant::now();
        let family = self.family()?;
        let runner = self.runner.as_ref();
        let settings = &self.settings;

        let (os_version, shells, tools) = tokio::join!(
            tools::detect_os_version(runner, &self.platform, settings.tool_probe_timeout()),
            tools::probe_shells(runner, family, settings.shell_probe_timeout()),
            tools::probe_tools(runner, family, settings.tool_probe_timeout()),
        );

        let group_probe = if settings.probe_process_group {
            probe::probe_process_group_kill(runner, settings.tool_probe_timeout()).await
        } else {
            false
        };
        let capabilities = derive_capabilities(family, &tools, group_probe);

        let performance = if settings.run_benchmarks {
            benchmark::run_benchmarks(runner, family, &tools, settings).await
        } else {
            BTreeMap::new()
        };
        let hints = benchmark::derive_hints(family, &performance, &tools, settings);

        let confidence = confidence_for(
            family,
            &tools,
            &capabilities,
            settings.confidence_tool_weight,
            settings.confidence_capability_weight,
        );

        let info = PlatformInfo {
            platform: self.platform.clone(),
            family,
            os_version,
            arch: std::env::consts::ARCH.to_string(),
            cpu: cpu_info(),
            shells,
            tools,
            capabilities,
            performance,
            hints,
            confidence,
            detected_at: chrono::Utc::now(),
        };

        info!(
            event = event_names::DETECT_FINISHED,
            platform = %info.platform,
            family = %info.family,
            version = %info.os_version.version,
            capabilities = info.available_capability_count(),
            confidence = info.confidence,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "platform detected"
        );
        Ok(info)
    }
}

fn cpu_info() -> CpuInfo {
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let mut sys = sysinfo::System::new();
    sys.refresh_cpu();
    let brand = sys
        .cpus()
        .first()
        .map(|c| c.brand().trim().to_string())
        .filter(|b| !b.is_empty());
    debug!(logical_cores, brand = ?brand, "cpu facts");
    CpuInfo {
        logical_cores,
        brand,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedRunner;

    fn quick_settings() -> DetectorSettings {
        DetectorSettings {
            probe_process_group: false,
            run_benchmarks: false,
            ..DetectorSettings::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_platform_is_fatal() {
        let runner = Arc::new(ScriptedRunner::new());
        let detector = PlatformDetector::new(runner, quick_settings()).with_platform("plan9");
        let err = detector.detect(false).await.unwrap_err();
        assert!(matches!(err, DetectionError::UnknownPlatform(ref p) if p == "plan9"));
        assert!(detector.recommended_provider().is_err());
        let common: pw_common::Error = err.into();
        assert_eq!(common.code(), 31);
    }

    #[tokio::test]
    async fn test_detect_caches_until_forced() {
        let runner = Arc::new(ScriptedRunner::new());
        let detector =
            PlatformDetector::new(runner.clone(), quick_settings()).with_platform("linux");

        let first = detector.detect(false).await.unwrap();
        let calls = runner.call_count();
        let second = detector.detect(false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(runner.call_count(), calls);

        let third = detector.detect(true).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert!(runner.call_count() > calls);
    }

    #[tokio::test]
    async fn test_invalidate_clears_cache() {
        let runner = Arc::new(ScriptedRunner::new());
        let detector = PlatformDetector::new(runner, quick_settings()).with_platform("linux");
        assert!(detector.cached().is_none());
        detector.detect(false).await.unwrap();
        assert!(detector.cached().is_some());
        detector.invalidate();
        assert!(detector.cached().is_none());
    }

    #[tokio::test]
    async fn test_supports_feature_detects_lazily() {
        use crate::test_utils::ScriptedResponse;
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("which", &[], ScriptedResponse::exit(1, ""))
                .on("which", &["ps"], ScriptedResponse::ok("/bin/ps\n")),
        );
        let detector = PlatformDetector::new(runner, quick_settings()).with_platform("linux");
        assert!(detector.cached().is_none());
        assert!(detector.supports_feature(caps::LIST_PROCESSES).await.unwrap());
        assert!(!detector.supports_feature(caps::KILL_BY_PID).await.unwrap());
        assert!(detector.cached().is_some());
    }

    #[test]
    fn test_recommended_provider_by_family() {
        let runner = Arc::new(ScriptedRunner::new());
        let detector =
            PlatformDetector::new(runner.clone(), quick_settings()).with_platform("windows");
        assert_eq!(detector.recommended_provider().unwrap(), ProviderKind::Windows);
        let detector = PlatformDetector::new(runner, quick_settings()).with_platform("freebsd");
        assert_eq!(detector.recommended_provider().unwrap(), ProviderKind::Unix);
    }
}
