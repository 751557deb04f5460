//! Operation optimization.
//!
//! The [`OptimizationEngine`] threads each operation through an ordered set
//! of [`Strategy`] implementations before the facade sees it, and learns
//! from the outcomes afterwards:
//!
//! - `result_cache` answers repeated reads without touching the OS
//! - `batch_sizing` fills in the platform batch size
//! - `resource_aware` trades batch size for timeout under host pressure
//! - `adaptive_timeout` stretches timeouts that recent latency runs close to
//!
//! Strategies never fail an operation: errors are logged and the strategy is
//! skipped. The [`Batcher`] groups same-shaped kills into one backend call.

pub mod batch;
pub mod cache;
pub mod history;
pub mod resource;
pub mod strategies;
pub mod strategy;

pub use batch::Batcher;
pub use cache::ResultCache;
pub use history::{HistoryEntry, KindSummary, OperationHistory};
pub use resource::{FixedMonitor, ResourceMonitor, ResourceSnapshot, SysinfoMonitor};
pub use strategy::{
    Impact, Strategy, StrategyContext, StrategyError, StrategyInfo, StrategyOutcome,
    StrategyRegistry,
};

use crate::provider::{Operation, OperationKind, OperationOutput};
use pw_common::{Error, OsFamily, Result};
use pw_config::ProcwardConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

impl From<StrategyError> for Error {
    fn from(err: StrategyError) -> Self {
        match err {
            StrategyError::Failed { strategy, reason } => {
                Error::execution("optimize", strategy, reason)
            }
        }
    }
}

/// An operation after optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimized {
    pub operation: Operation,
    /// Strategies that changed or answered the operation, in order.
    pub applied: Vec<String>,
    /// Set when a strategy answered the operation without execution.
    pub cached: Option<OperationOutput>,
}

impl Optimized {
    fn passthrough(operation: &Operation) -> Self {
        Self {
            operation: operation.clone(),
            applied: Vec::new(),
            cached: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Concern {
    HighLatency,
    LowSuccessRate,
}

/// A kind whose recent history looks unhealthy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub kind: OperationKind,
    pub concern: Concern,
    pub message: String,
}

/// Strategy pipeline plus the history and cache it learns from.
#[derive(Debug)]
pub struct OptimizationEngine {
    config: Arc<ProcwardConfig>,
    family: OsFamily,
    registry: RwLock<StrategyRegistry>,
    history: Mutex<OperationHistory>,
    cache: ResultCache,
    monitor: Arc<dyn ResourceMonitor>,
}

impl OptimizationEngine {
    /// Engine with the built-in strategies registered. Names listed in
    /// `optimizer.disabled_strategies` start disabled.
    pub fn new(
        config: Arc<ProcwardConfig>,
        family: OsFamily,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Self {
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(strategies::ResultCacheStrategy));
        registry.register(Arc::new(strategies::BatchSizingStrategy));
        registry.register(Arc::new(strategies::ResourceAwareStrategy));
        registry.register(Arc::new(strategies::AdaptiveTimeoutStrategy));
        for name in &config.optimizer.disabled_strategies {
            if !registry.set_enabled(name, false) {
                warn!(strategy = %name, "unknown strategy in disabled_strategies");
            }
        }
        let history = OperationHistory::new(config.optimizer.history_size);
        Self {
            config,
            family,
            registry: RwLock::new(registry),
            history: Mutex::new(history),
            cache: ResultCache::new(),
            monitor,
        }
    }

    pub fn family(&self) -> OsFamily {
        self.family
    }

    pub fn register(&self, strategy: Arc<dyn Strategy>) {
        self.registry_mut().register(strategy);
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        self.registry_mut().set_enabled(name, enabled)
    }

    pub fn disable_all(&self) {
        self.registry_mut().disable_all();
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .strategy_names()
    }

    /// Every registered strategy with its impact and enable flag.
    pub fn strategies(&self) -> Vec<StrategyInfo> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .describe()
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, StrategyRegistry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Run every enabled, applicable strategy in registry order.
    pub fn optimize(&self, operation: &Operation) -> Optimized {
        let settings = &self.config.optimizer;
        if !settings.enabled {
            return Optimized::passthrough(operation);
        }

        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let resources = if operation.kind().is_kill() {
            self.monitor.sample()
        } else {
            ResourceSnapshot::default()
        };
        let ctx = StrategyContext {
            family: self.family,
            kill: self.config.kill_settings(self.family),
            settings,
            history: &history,
            cache: &self.cache,
            resources,
        };

        let mut current = operation.clone();
        let mut applied = Vec::new();
        for strategy in registry.enabled() {
            if !strategy.applies_to(&current) {
                continue;
            }
            match strategy.apply(&current, &ctx) {
                Ok(Some(StrategyOutcome::Adjusted(next))) => {
                    applied.push(strategy.name().to_string());
                    current = next;
                }
                Ok(Some(StrategyOutcome::Cached(output))) => {
                    applied.push(strategy.name().to_string());
                    debug!(
                        kind = %current.kind(),
                        strategy = strategy.name(),
                        "answered from cache"
                    );
                    return Optimized {
                        operation: current,
                        applied,
                        cached: Some(output),
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(strategy = strategy.name(), error = %e, "strategy skipped");
                }
            }
        }

        if !applied.is_empty() {
            debug!(kind = %current.kind(), ?applied, "operation optimized");
        }
        Optimized {
            operation: current,
            applied,
            cached: None,
        }
    }

    /// Learn from an executed operation.
    pub fn record_operation(
        &self,
        operation: &Operation,
        result: &Result<OperationOutput>,
        duration: Duration,
    ) {
        let kind = operation.kind();
        let success = result.as_ref().is_ok_and(OperationOutput::succeeded);
        let avg_ms = {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.record(kind, HistoryEntry { duration, success });
            history.summary(kind).map_or(0.0, |s| s.avg_ms)
        };

        if kind.is_kill() {
            self.cache.clear();
        } else if kind.is_cacheable_read() && self.config.optimizer.enabled {
            if let Ok(output) = result {
                let ttl = self.config.optimizer.adaptive_ttl(avg_ms);
                self.cache.put(operation.cache_key(), output.clone(), ttl);
            }
        }
    }

    /// Kinds whose recent latency or success rate crosses the configured
    /// thresholds.
    pub fn recommendations(&self) -> Vec<Recommendation> {
        let settings = &self.config.optimizer;
        let mut out = Vec::new();
        for (kind, summary) in self.summaries() {
            if summary.avg_ms > settings.recommend_latency_ms {
                out.push(Recommendation {
                    kind,
                    concern: Concern::HighLatency,
                    message: format!(
                        "{kind} averages {:.0}ms over {} calls; consider raising timeouts or lowering batch sizes",
                        summary.avg_ms, summary.samples
                    ),
                });
            }
            if summary.success_rate < settings.recommend_min_success_rate {
                out.push(Recommendation {
                    kind,
                    concern: Concern::LowSuccessRate,
                    message: format!(
                        "{kind} succeeded {:.0}% of {} calls; check permissions and targets",
                        summary.success_rate * 100.0,
                        summary.samples
                    ),
                });
            }
        }
        out
    }

    pub fn summaries(&self) -> BTreeMap<OperationKind, KindSummary> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .summaries()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Drop history and cached results.
    pub fn reset(&self) {
        self.cache.clear();
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{KillOptions, ListOptions};

    #[derive(Debug)]
    struct Broken;

    impl Strategy for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn applies_to(&self, _operation: &Operation) -> bool {
            true
        }

        fn apply(
            &self,
            _operation: &Operation,
            _ctx: &StrategyContext<'_>,
        ) -> std::result::Result<Option<StrategyOutcome>, StrategyError> {
            Err(StrategyError::Failed {
                strategy: "broken",
                reason: "always".into(),
            })
        }
    }

    fn engine_with(config: ProcwardConfig, pressure: f64) -> OptimizationEngine {
        OptimizationEngine::new(
            Arc::new(config),
            OsFamily::Unix,
            Arc::new(FixedMonitor::new(pressure, 0.0)),
        )
    }

    fn kill_op() -> Operation {
        Operation::KillByPid {
            pid: 4242,
            options: KillOptions::default(),
        }
    }

    fn list_op() -> Operation {
        Operation::ListProcesses {
            options: ListOptions::default(),
        }
    }

    #[test]
    fn test_builtins_registered_in_order() {
        let engine = engine_with(ProcwardConfig::default(), 0.5);
        assert_eq!(
            engine.strategy_names(),
            vec!["result_cache", "batch_sizing", "resource_aware", "adaptive_timeout"]
        );
    }

    #[test]
    fn test_kill_gets_batch_size_then_pressure_adjustment() {
        let engine = engine_with(ProcwardConfig::default(), 0.95);
        let optimized = engine.optimize(&kill_op());
        assert_eq!(optimized.applied, vec!["batch_sizing", "resource_aware"]);
        let options = optimized.operation.kill_options().unwrap();
        assert_eq!(options.batch_size, Some(25));
        assert_eq!(options.timeout, Some(Duration::from_millis(7_500)));
    }

    #[test]
    fn test_strategies_report_impact_and_enable_flag() {
        let engine = engine_with(ProcwardConfig::default(), 0.5);
        assert!(engine.set_enabled("result_cache", false));
        let infos = engine.strategies();
        assert_eq!(infos.len(), 4);
        let cache = infos.iter().find(|i| i.name == "result_cache").unwrap();
        assert_eq!(cache.impact, Impact::High);
        assert!(!cache.enabled);
        let batch = infos.iter().find(|i| i.name == "batch_sizing").unwrap();
        assert_eq!(batch.impact, Impact::Low);
        assert!(batch.enabled);
    }

    #[test]
    fn test_disabled_engine_passes_through() {
        let mut config = ProcwardConfig::default();
        config.optimizer.enabled = false;
        let engine = engine_with(config, 0.95);
        let optimized = engine.optimize(&kill_op());
        assert_eq!(optimized, Optimized::passthrough(&kill_op()));
    }

    #[test]
    fn test_disabled_strategies_from_config() {
        let mut config = ProcwardConfig::default();
        config.optimizer.disabled_strategies = vec!["resource_aware".into(), "nope".into()];
        let engine = engine_with(config, 0.95);
        assert_eq!(engine.optimize(&kill_op()).applied, vec!["batch_sizing"]);
    }

    #[test]
    fn test_strategy_errors_are_skipped() {
        let engine = engine_with(ProcwardConfig::default(), 0.5);
        engine.register(Arc::new(Broken));
        let optimized = engine.optimize(&kill_op());
        assert_eq!(optimized.applied, vec!["batch_sizing"]);
    }

    #[test]
    fn test_read_is_cached_until_a_kill() {
        let engine = engine_with(ProcwardConfig::default(), 0.5);
        let output = OperationOutput::Exists(true);
        engine.record_operation(&list_op(), &Ok(output.clone()), Duration::from_millis(5));

        let optimized = engine.optimize(&list_op());
        assert_eq!(optimized.cached, Some(output));
        assert_eq!(optimized.applied, vec!["result_cache"]);

        engine.record_operation(
            &kill_op(),
            &Err(Error::Validation("x".into())),
            Duration::from_millis(5),
        );
        assert!(engine.optimize(&list_op()).cached.is_none());
    }

    #[test]
    fn test_disable_all_means_no_cache_hits() {
        let engine = engine_with(ProcwardConfig::default(), 0.95);
        engine.record_operation(&list_op(), &Ok(OperationOutput::Exists(true)), Duration::ZERO);
        engine.disable_all();
        assert_eq!(engine.optimize(&list_op()), Optimized::passthrough(&list_op()));
        assert_eq!(engine.optimize(&kill_op()), Optimized::passthrough(&kill_op()));
    }

    #[test]
    fn test_recommendations_flag_slow_and_failing_kinds() {
        let engine = engine_with(ProcwardConfig::default(), 0.5);
        for _ in 0..4 {
            engine.record_operation(
                &list_op(),
                &Ok(OperationOutput::Exists(true)),
                Duration::from_millis(2_500),
            );
            engine.record_operation(
                &kill_op(),
                &Err(Error::PermissionDenied { pid: 4242 }),
                Duration::from_millis(10),
            );
        }
        let recs = engine.recommendations();
        assert!(recs
            .iter()
            .any(|r| r.kind == OperationKind::ListProcesses && r.concern == Concern::HighLatency));
        assert!(recs
            .iter()
            .any(|r| r.kind == OperationKind::KillByPid && r.concern == Concern::LowSuccessRate));
        assert_eq!(recs.len(), 2);

        engine.reset();
        assert!(engine.recommendations().is_empty());
    }
}
