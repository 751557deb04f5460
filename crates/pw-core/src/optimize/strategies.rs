//! Built-in strategies, in the order the engine registers them.

use super::strategy::{Impact, Strategy, StrategyContext, StrategyError, StrategyOutcome};
use crate::provider::Operation;
use std::time::Duration;

/// Minimum samples before latency history drives a timeout change.
const MIN_TIMEOUT_SAMPLES: usize = 3;

/// Latency at or above this share of the timeout counts as "near" it.
const TIMEOUT_HEADROOM: f64 = 0.8;

pub const RESULT_CACHE: &str = "result_cache";
pub const BATCH_SIZING: &str = "batch_sizing";
pub const RESOURCE_AWARE: &str = "resource_aware";
pub const ADAPTIVE_TIMEOUT: &str = "adaptive_timeout";

/// Answer cacheable reads from the engine's result cache.
#[derive(Debug, Default)]
pub struct ResultCacheStrategy;

impl Strategy for ResultCacheStrategy {
    fn name(&self) -> &'static str {
        RESULT_CACHE
    }

    fn impact(&self) -> Impact {
        Impact::High
    }

    fn applies_to(&self, operation: &Operation) -> bool {
        operation.kind().is_cacheable_read()
    }

    fn apply(
        &self,
        operation: &Operation,
        ctx: &StrategyContext<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError> {
        Ok(ctx
            .cache
            .get(&operation.cache_key())
            .map(StrategyOutcome::Cached))
    }
}

/// Fill an unset batch size with the platform default.
#[derive(Debug, Default)]
pub struct BatchSizingStrategy;

impl Strategy for BatchSizingStrategy {
    fn name(&self) -> &'static str {
        BATCH_SIZING
    }

    fn impact(&self) -> Impact {
        Impact::Low
    }

    fn applies_to(&self, operation: &Operation) -> bool {
        operation
            .kill_options()
            .is_some_and(|o| o.batch_size.is_none())
    }

    fn apply(
        &self,
        operation: &Operation,
        ctx: &StrategyContext<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError> {
        if ctx.kill.batch_size == 0 {
            return Err(StrategyError::Failed {
                strategy: BATCH_SIZING,
                reason: "configured batch size is zero".to_string(),
            });
        }
        let mut adjusted = operation.clone();
        if let Some(options) = adjusted.kill_options_mut() {
            options.batch_size = Some(ctx.kill.batch_size);
        }
        Ok(Some(StrategyOutcome::Adjusted(adjusted)))
    }
}

/// Under high pressure halve the batch and give each kill half again as
/// long; under low pressure double the batch. Bounded by the configured
/// floor, ceiling and timeout cap.
#[derive(Debug, Default)]
pub struct ResourceAwareStrategy;

impl Strategy for ResourceAwareStrategy {
    fn name(&self) -> &'static str {
        RESOURCE_AWARE
    }

    fn impact(&self) -> Impact {
        Impact::Medium
    }

    fn applies_to(&self, operation: &Operation) -> bool {
        operation.kind().is_kill()
    }

    fn apply(
        &self,
        operation: &Operation,
        ctx: &StrategyContext<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError> {
        let Some(options) = operation.kill_options() else {
            return Ok(None);
        };
        let settings = ctx.settings;
        let pressure = ctx.resources.pressure();
        let batch = options.batch_size.unwrap_or(ctx.kill.batch_size);
        let timeout = options.timeout.unwrap_or_else(|| ctx.kill.default_timeout());
        let max_timeout = Duration::from_millis(settings.max_timeout_ms);

        let (new_batch, new_timeout) = if pressure >= settings.high_pressure {
            let batch = (batch / 2).max(settings.min_batch_size);
            let timeout = timeout.mul_f64(1.5).min(max_timeout);
            (batch, timeout)
        } else if pressure <= settings.low_pressure {
            let batch = batch.saturating_mul(2).min(settings.max_batch_size);
            (batch, timeout)
        } else {
            return Ok(None);
        };

        if Some(new_batch) == options.batch_size && Some(new_timeout) == options.timeout {
            return Ok(None);
        }
        let mut adjusted = operation.clone();
        if let Some(options) = adjusted.kill_options_mut() {
            options.batch_size = Some(new_batch);
            options.timeout = Some(new_timeout);
        }
        Ok(Some(StrategyOutcome::Adjusted(adjusted)))
    }
}

/// Stretch the timeout when recent latency for the kind runs close to it.
#[derive(Debug, Default)]
pub struct AdaptiveTimeoutStrategy;

impl Strategy for AdaptiveTimeoutStrategy {
    fn name(&self) -> &'static str {
        ADAPTIVE_TIMEOUT
    }

    fn applies_to(&self, operation: &Operation) -> bool {
        operation.kind().is_kill()
    }

    fn apply(
        &self,
        operation: &Operation,
        ctx: &StrategyContext<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError> {
        let Some(options) = operation.kill_options() else {
            return Ok(None);
        };
        let Some(summary) = ctx.history.summary(operation.kind()) else {
            return Ok(None);
        };
        if summary.samples < MIN_TIMEOUT_SAMPLES {
            return Ok(None);
        }

        let current = options.timeout.unwrap_or_else(|| ctx.kill.default_timeout());
        let current_ms = current.as_secs_f64() * 1000.0;
        if summary.avg_ms < current_ms * TIMEOUT_HEADROOM {
            return Ok(None);
        }

        let max_ms = ctx.settings.max_timeout_ms as f64;
        let target_ms = (summary.avg_ms * 2.0).min(max_ms);
        if target_ms <= current_ms {
            return Ok(None);
        }
        let mut adjusted = operation.clone();
        if let Some(options) = adjusted.kill_options_mut() {
            options.timeout = Some(Duration::from_millis(target_ms.round() as u64));
        }
        Ok(Some(StrategyOutcome::Adjusted(adjusted)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::cache::ResultCache;
    use crate::optimize::history::{HistoryEntry, OperationHistory};
    use crate::optimize::resource::ResourceSnapshot;
    use crate::provider::{KillOptions, ListOptions, OperationKind, OperationOutput};
    use pw_common::OsFamily;
    use pw_config::{KillSettings, OptimizerSettings};

    struct Fixture {
        kill: KillSettings,
        settings: OptimizerSettings,
        history: OperationHistory,
        cache: ResultCache,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                kill: KillSettings::unix_defaults(),
                settings: OptimizerSettings::default(),
                history: OperationHistory::new(10),
                cache: ResultCache::new(),
            }
        }

        fn ctx(&self, pressure: f64) -> StrategyContext<'_> {
            StrategyContext {
                family: OsFamily::Unix,
                kill: &self.kill,
                settings: &self.settings,
                history: &self.history,
                cache: &self.cache,
                resources: ResourceSnapshot::new(pressure, 0.0),
            }
        }
    }

    fn kill_op(batch: Option<usize>, timeout_ms: Option<u64>) -> Operation {
        Operation::KillByName {
            pattern: "worker".into(),
            options: KillOptions {
                batch_size: batch,
                timeout: timeout_ms.map(Duration::from_millis),
                ..KillOptions::default()
            },
        }
    }

    fn adjusted(outcome: Option<StrategyOutcome>) -> KillOptions {
        match outcome {
            Some(StrategyOutcome::Adjusted(op)) => op.kill_options().cloned().unwrap(),
            other => panic!("expected adjustment, got {other:?}"),
        }
    }

    #[test]
    fn test_result_cache_short_circuits_reads() {
        let fx = Fixture::new();
        let op = Operation::ListProcesses {
            options: ListOptions::default(),
        };
        assert!(ResultCacheStrategy.apply(&op, &fx.ctx(0.5)).unwrap().is_none());
        fx.cache
            .put(op.cache_key(), OperationOutput::Exists(true), Duration::from_secs(5));
        assert_eq!(
            ResultCacheStrategy.apply(&op, &fx.ctx(0.5)).unwrap(),
            Some(StrategyOutcome::Cached(OperationOutput::Exists(true)))
        );
        assert!(!ResultCacheStrategy.applies_to(&kill_op(None, None)));
    }

    #[test]
    fn test_batch_sizing_fills_platform_default() {
        let fx = Fixture::new();
        let op = kill_op(None, None);
        assert!(BatchSizingStrategy.applies_to(&op));
        let options = adjusted(BatchSizingStrategy.apply(&op, &fx.ctx(0.5)).unwrap());
        assert_eq!(options.batch_size, Some(fx.kill.batch_size));
        assert!(!BatchSizingStrategy.applies_to(&kill_op(Some(7), None)));
    }

    #[test]
    fn test_resource_aware_bounds() {
        let fx = Fixture::new();

        let options = adjusted(
            ResourceAwareStrategy
                .apply(&kill_op(Some(8), Some(1_000)), &fx.ctx(0.95))
                .unwrap(),
        );
        assert_eq!(options.batch_size, Some(fx.settings.min_batch_size));
        assert_eq!(options.timeout, Some(Duration::from_millis(1_500)));

        let options = adjusted(
            ResourceAwareStrategy
                .apply(&kill_op(Some(150), Some(1_000)), &fx.ctx(0.1))
                .unwrap(),
        );
        assert_eq!(options.batch_size, Some(fx.settings.max_batch_size));
        assert_eq!(options.timeout, Some(Duration::from_millis(1_000)));

        assert!(ResourceAwareStrategy
            .apply(&kill_op(Some(50), Some(1_000)), &fx.ctx(0.5))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_adaptive_timeout_needs_history_near_limit() {
        let mut fx = Fixture::new();
        let op = kill_op(Some(10), Some(1_000));
        assert!(AdaptiveTimeoutStrategy.apply(&op, &fx.ctx(0.5)).unwrap().is_none());

        for _ in 0..3 {
            fx.history.record(
                OperationKind::KillByName,
                HistoryEntry {
                    duration: Duration::from_millis(900),
                    success: true,
                },
            );
        }
        let options = adjusted(AdaptiveTimeoutStrategy.apply(&op, &fx.ctx(0.5)).unwrap());
        assert_eq!(options.timeout, Some(Duration::from_millis(1_800)));

        let relaxed = kill_op(Some(10), Some(10_000));
        assert!(AdaptiveTimeoutStrategy
            .apply(&relaxed, &fx.ctx(0.5))
            .unwrap()
            .is_none());
    }
}
