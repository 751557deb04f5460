//! The `ProcessProvider` facade.
//!
//! Selects and initializes the platform backend once, normalizes options for
//! it, caches reads briefly, keeps per-operation statistics and routes
//! [`Operation`] values to the typed calls. All state lives in the instance.

use super::{
    KillByNameResult, KillOptions, KillResult, ListOptions, Operation, OperationKind,
    OperationOutput, ProcessControl, ProcessSnapshot, ServiceResult, SignalResult,
    TreeKillResult,
};
use crate::collect::{CommandRunner, ProcessRecord};
use crate::detect::{PlatformDetector, PlatformInfo};
use crate::logging::events::event_names;
use chrono::{DateTime, Utc};
use pw_common::{Error, ErrorCategory, OsFamily, Result, Signal};
use pw_config::ProcwardConfig;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Builds the backend for a detected platform.
pub type BackendFactory =
    Arc<dyn Fn(Arc<PlatformInfo>) -> Result<Arc<dyn ProcessControl>> + Send + Sync>;

/// Calls, failures and latency for one operation kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationStats {
    pub calls: u64,
    /// Errors plus results that did not achieve their goal.
    pub failures: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
}

impl OperationStats {
    fn record(&mut self, elapsed: Duration, failed: bool) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.calls += 1;
        if failed {
            self.failures += 1;
        }
        self.avg_latency_ms += (ms - self.avg_latency_ms) / self.calls as f64;
        self.max_latency_ms = self.max_latency_ms.max(ms);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderStatistics {
    pub operations: BTreeMap<OperationKind, OperationStats>,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl ProviderStatistics {
    pub fn total_calls(&self) -> u64 {
        self.operations.values().map(|s| s.calls).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.operations.values().map(|s| s.failures).sum()
    }

    pub fn error_rate(&self) -> f64 {
        match self.total_calls() {
            0 => 0.0,
            calls => self.total_failures() as f64 / calls as f64,
        }
    }

    /// Call-weighted average latency across operations.
    pub fn avg_latency_ms(&self) -> f64 {
        let calls = self.total_calls();
        if calls == 0 {
            return 0.0;
        }
        self.operations
            .values()
            .map(|s| s.avg_latency_ms * s.calls as f64)
            .sum::<f64>()
            / calls as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub self_test_passed: bool,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    /// Why the check failed, when it did.
    pub reasons: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone)]
struct Backend {
    control: Arc<dyn ProcessControl>,
    platform: Arc<PlatformInfo>,
}

#[derive(Debug, Clone)]
struct CachedRead {
    at: Instant,
    output: OperationOutput,
}

/// Uniform process control over whichever backend fits the host.
pub struct ProcessProvider {
    detector: Arc<PlatformDetector>,
    config: Arc<ProcwardConfig>,
    factory: BackendFactory,
    fallback: Option<Arc<dyn ProcessControl>>,
    backend: RwLock<Option<Backend>>,
    init_lock: tokio::sync::Mutex<()>,
    read_cache: Mutex<HashMap<String, CachedRead>>,
    stats: Mutex<ProviderStatistics>,
}

impl std::fmt::Debug for ProcessProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessProvider")
            .field("initialized", &self.is_initialized())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ProcessProvider {
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<ProcwardConfig>) -> Self {
        let detector = Arc::new(PlatformDetector::new(
            Arc::clone(&runner),
            config.detector.clone(),
        ));
        Self::with_detector(detector, runner, config)
    }

    pub fn with_detector(
        detector: Arc<PlatformDetector>,
        runner: Arc<dyn CommandRunner>,
        config: Arc<ProcwardConfig>,
    ) -> Self {
        let factory = default_factory(runner, Arc::clone(&config));
        Self {
            detector,
            config,
            factory,
            fallback: None,
            backend: RwLock::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            read_cache: Mutex::new(HashMap::new()),
            stats: Mutex::new(ProviderStatistics::default()),
        }
    }

    /// Replace how the backend is built from the detected platform.
    pub fn with_backend_factory(mut self, factory: BackendFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Backend tried when the primary fails with an execution error.
    pub fn with_fallback(mut self, fallback: Arc<dyn ProcessControl>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn config(&self) -> &ProcwardConfig {
        &self.config
    }

    pub fn detector(&self) -> &Arc<PlatformDetector> {
        &self.detector
    }

    pub fn is_initialized(&self) -> bool {
        self.current().is_some()
    }

    /// Detection snapshot of the initialized backend.
    pub fn platform(&self) -> Option<Arc<PlatformInfo>> {
        self.current().map(|b| b.platform)
    }

    fn current(&self) -> Option<Backend> {
        self.backend
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Detect, build and self-test the backend. Concurrent callers share one
    /// attempt; later calls return immediately.
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_backend().await.map(|_| ())
    }

    async fn ensure_backend(&self) -> Result<Backend> {
        if let Some(backend) = self.current() {
            return Ok(backend);
        }
        let _guard = self.init_lock.lock().await;
        if let Some(backend) = self.current() {
            return Ok(backend);
        }

        let platform = self.detector.detect(false).await?;
        let control = (self.factory)(Arc::clone(&platform))?;
        control.self_test().await.map_err(|e| {
            Error::execution("initialize", &platform.platform, format!("self-test failed: {e}"))
        })?;

        info!(
            event = event_names::PROVIDER_INITIALIZED,
            platform = %platform.platform,
            provider = %platform.provider_kind(),
            "process provider initialized"
        );
        let backend = Backend { control, platform };
        *self.backend.write().unwrap_or_else(|e| e.into_inner()) = Some(backend.clone());
        Ok(backend)
    }

    /// Drop caches, statistics, backend and detection, then start over.
    pub async fn reinitialize(&self) -> Result<()> {
        {
            let _guard = self.init_lock.lock().await;
            *self.backend.write().unwrap_or_else(|e| e.into_inner()) = None;
            self.clear_cache();
            *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = ProviderStatistics::default();
            self.detector.invalidate();
        }
        self.initialize().await
    }

    /// Static capability flags merged with the backend's runtime flags.
    /// Keys present in both are AND-ed.
    pub async fn get_capabilities(&self) -> Result<BTreeMap<String, bool>> {
        let backend = self.ensure_backend().await?;
        let mut merged = backend.platform.capabilities.clone();
        for (name, runtime) in backend.control.runtime_capabilities() {
            merged
                .entry(name)
                .and_modify(|v| *v = *v && runtime)
                .or_insert(runtime);
        }
        Ok(merged)
    }

    pub fn get_statistics(&self) -> ProviderStatistics {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Re-run the self-test and judge recorded error rate and latency.
    pub async fn perform_health_check(&self) -> Result<HealthReport> {
        let backend = self.ensure_backend().await?;
        let mut reasons = Vec::new();

        let self_test_passed = match backend.control.self_test().await {
            Ok(()) => true,
            Err(e) => {
                reasons.push(format!("self-test failed: {e}"));
                false
            }
        };

        let stats = self.get_statistics();
        let error_rate = stats.error_rate();
        let avg_latency_ms = stats.avg_latency_ms();
        let settings = &self.config.facade;
        if error_rate > settings.max_error_rate {
            reasons.push(format!(
                "error rate {:.1}% above {:.1}%",
                error_rate * 100.0,
                settings.max_error_rate * 100.0
            ));
        }
        if avg_latency_ms > settings.max_avg_latency_ms {
            reasons.push(format!(
                "average latency {avg_latency_ms:.0}ms above {:.0}ms",
                settings.max_avg_latency_ms
            ));
        }

        let healthy = reasons.is_empty();
        if healthy {
            info!(event = event_names::HEALTH_CHECKED, healthy, "provider healthy");
        } else {
            warn!(
                event = event_names::HEALTH_CHECKED,
                healthy,
                ?reasons,
                "provider unhealthy"
            );
        }
        Ok(HealthReport {
            healthy,
            self_test_passed,
            error_rate,
            avg_latency_ms,
            reasons,
            checked_at: Utc::now(),
        })
    }

    pub fn clear_cache(&self) {
        self.read_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Fill defaults and map options onto what the platform can express.
    pub fn normalize_options(&self, family: OsFamily, options: &KillOptions) -> KillOptions {
        let settings = self.config.kill_settings(family);
        let mut normalized = options.clone();
        match family {
            OsFamily::Windows => {
                if normalized.signal.is_some_and(|s| s.is_forceful()) {
                    normalized.force = true;
                }
                normalized.signal = None;
            }
            OsFamily::Unix => {
                if normalized.force {
                    normalized.signal = Some(Signal::Kill);
                }
            }
        }
        normalized.timeout.get_or_insert(settings.default_timeout());
        normalized.batch_size.get_or_insert(settings.batch_size);
        if normalized.max_matches.is_none() {
            normalized.max_matches = settings.default_max_matches;
        }
        normalized
    }

    fn cached(&self, key: &str) -> Option<OperationOutput> {
        let ttl = self.config.facade.read_cache_ttl();
        let mut cache = self.read_cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(key) {
            Some(entry) if entry.at.elapsed() < ttl => Some(entry.output.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn note_cache(&self, hit: bool) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        if hit {
            stats.cache_hits += 1;
        } else {
            stats.cache_misses += 1;
        }
    }

    /// Run one operation through normalization, cache, backend and stats.
    pub async fn dispatch(&self, operation: Operation) -> Result<OperationOutput> {
        let backend = self.ensure_backend().await?;
        let mut operation = operation;
        let family = backend.control.family();
        if let Some(options) = operation.kill_options_mut() {
            *options = self.normalize_options(family, options);
        }

        let kind = operation.kind();
        let cacheable = self.config.facade.cache_enabled && kind.is_cacheable_read();
        let key = operation.cache_key();
        if cacheable {
            if let Some(hit) = self.cached(&key) {
                self.note_cache(true);
                debug!(%kind, "read served from cache");
                return Ok(hit);
            }
            self.note_cache(false);
        }

        let started = Instant::now();
        let mut result = run_on(backend.control.as_ref(), &operation).await;
        if let (Err(e), Some(fallback)) = (&result, &self.fallback) {
            if e.category() == ErrorCategory::Execution
                && !matches!(e, Error::PermissionDenied { .. })
            {
                warn!(%kind, error = %e, "primary backend failed, trying fallback");
                result = run_on(fallback.as_ref(), &operation).await;
            }
        }
        let elapsed = started.elapsed();

        let failed = result.as_ref().map(|o| !o.succeeded()).unwrap_or(true);
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .operations
            .entry(kind)
            .or_default()
            .record(elapsed, failed);

        match result {
            Ok(output) => {
                if kind.is_kill() {
                    self.clear_cache();
                } else if cacheable {
                    self.read_cache
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(
                            key,
                            CachedRead {
                                at: Instant::now(),
                                output: output.clone(),
                            },
                        );
                }
                Ok(output)
            }
            Err(e) => {
                debug!(%kind, error = %e, "operation failed");
                Err(match e {
                    Error::Io(_) | Error::Json(_) => {
                        Error::execution(kind.as_str(), operation.target(), e.to_string())
                    }
                    other => other,
                })
            }
        }
    }

    pub async fn kill_by_pid(&self, pid: u32, options: &KillOptions) -> Result<KillResult> {
        let op = Operation::KillByPid {
            pid,
            options: options.clone(),
        };
        match self.dispatch(op).await? {
            OperationOutput::Kill(r) => Ok(r),
            other => Err(mismatch(OperationKind::KillByPid, &other)),
        }
    }

    pub async fn kill_by_name(
        &self,
        pattern: &str,
        options: &KillOptions,
    ) -> Result<KillByNameResult> {
        let op = Operation::KillByName {
            pattern: pattern.to_string(),
            options: options.clone(),
        };
        match self.dispatch(op).await? {
            OperationOutput::KillByName(r) => Ok(r),
            other => Err(mismatch(OperationKind::KillByName, &other)),
        }
    }

    pub async fn kill_process_tree(
        &self,
        root: u32,
        options: &KillOptions,
    ) -> Result<TreeKillResult> {
        let op = Operation::KillProcessTree {
            root,
            options: options.clone(),
        };
        match self.dispatch(op).await? {
            OperationOutput::Tree(r) => Ok(r),
            other => Err(mismatch(OperationKind::KillProcessTree, &other)),
        }
    }

    pub async fn list_processes(&self, options: &ListOptions) -> Result<ProcessSnapshot> {
        let op = Operation::ListProcesses {
            options: options.clone(),
        };
        match self.dispatch(op).await? {
            OperationOutput::Processes(s) => Ok(s),
            other => Err(mismatch(OperationKind::ListProcesses, &other)),
        }
    }

    pub async fn get_process_info(&self, pid: u32) -> Result<Option<ProcessRecord>> {
        match self.dispatch(Operation::GetProcessInfo { pid }).await? {
            OperationOutput::ProcessInfo(r) => Ok(r),
            other => Err(mismatch(OperationKind::GetProcessInfo, &other)),
        }
    }

    pub async fn process_exists(&self, pid: u32) -> Result<bool> {
        match self.dispatch(Operation::ProcessExists { pid }).await? {
            OperationOutput::Exists(b) => Ok(b),
            other => Err(mismatch(OperationKind::ProcessExists, &other)),
        }
    }

    pub async fn kill_service(&self, name: &str, options: &KillOptions) -> Result<ServiceResult> {
        let op = Operation::KillService {
            name: name.to_string(),
            options: options.clone(),
        };
        match self.dispatch(op).await? {
            OperationOutput::Service(r) => Ok(r),
            other => Err(mismatch(OperationKind::KillService, &other)),
        }
    }

    pub async fn send_signal(&self, pid: u32, signal: &str) -> Result<SignalResult> {
        let op = Operation::SendSignal {
            pid,
            signal: signal.to_string(),
        };
        match self.dispatch(op).await? {
            OperationOutput::Signal(r) => Ok(r),
            other => Err(mismatch(OperationKind::SendSignal, &other)),
        }
    }

    /// Kill many pids with one option set, straight through the backend.
    /// Used by the batcher; statistics are recorded per pid.
    pub async fn kill_many(
        &self,
        pids: &[u32],
        options: &KillOptions,
    ) -> Result<Vec<Result<KillResult>>> {
        let backend = self.ensure_backend().await?;
        let options = self.normalize_options(backend.control.family(), options);
        let started = Instant::now();
        let results = backend.control.kill_many(pids, &options).await;
        let per_pid = started.elapsed() / pids.len().max(1) as u32;
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            let entry = stats.operations.entry(OperationKind::KillByPid).or_default();
            for result in &results {
                entry.record(per_pid, !matches!(result, Ok(r) if r.success));
            }
        }
        self.clear_cache();
        Ok(results)
    }
}

fn mismatch(kind: OperationKind, output: &OperationOutput) -> Error {
    Error::execution(
        kind.as_str(),
        "dispatch",
        format!("backend returned mismatched output {output:?}"),
    )
}

/// Route an operation to the typed backend call.
pub async fn run_on(
    control: &dyn ProcessControl,
    operation: &Operation,
) -> Result<OperationOutput> {
    Ok(match operation {
        Operation::KillByPid { pid, options } => {
            OperationOutput::Kill(control.kill_by_pid(*pid, options).await?)
        }
        Operation::KillByName { pattern, options } => {
            OperationOutput::KillByName(control.kill_by_name(pattern, options).await?)
        }
        Operation::KillProcessTree { root, options } => {
            OperationOutput::Tree(control.kill_process_tree(*root, options).await?)
        }
        Operation::ListProcesses { options } => {
            OperationOutput::Processes(control.list_processes(options).await?)
        }
        Operation::GetProcessInfo { pid } => {
            OperationOutput::ProcessInfo(control.get_process_info(*pid).await?)
        }
        Operation::ProcessExists { pid } => {
            OperationOutput::Exists(control.process_exists(*pid).await?)
        }
        Operation::KillService { name, options } => {
            OperationOutput::Service(control.kill_service(name, options).await?)
        }
        Operation::SendSignal { pid, signal } => {
            OperationOutput::Signal(control.send_signal(*pid, signal).await?)
        }
    })
}

fn default_factory(runner: Arc<dyn CommandRunner>, config: Arc<ProcwardConfig>) -> BackendFactory {
    Arc::new(move |platform: Arc<PlatformInfo>| match platform.family {
        OsFamily::Unix => unix_backend(Arc::clone(&runner), platform, &config),
        OsFamily::Windows => Ok(Arc::new(super::windows::WindowsProvider::new(
            Arc::clone(&runner),
            platform,
            config.windows.clone(),
        )) as Arc<dyn ProcessControl>),
    })
}

#[cfg(unix)]
fn unix_backend(
    runner: Arc<dyn CommandRunner>,
    platform: Arc<PlatformInfo>,
    config: &ProcwardConfig,
) -> Result<Arc<dyn ProcessControl>> {
    Ok(Arc::new(super::unix::UnixProvider::new(
        runner,
        platform,
        config.unix.clone(),
    )))
}

#[cfg(not(unix))]
fn unix_backend(
    _runner: Arc<dyn CommandRunner>,
    platform: Arc<PlatformInfo>,
    _config: &ProcwardConfig,
) -> Result<Arc<dyn ProcessControl>> {
    Err(Error::unsupported("unix provider", platform.platform.clone()))
}
