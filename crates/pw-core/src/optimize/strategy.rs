//! Strategy contract and registry.

use super::cache::ResultCache;
use super::history::OperationHistory;
use super::resource::ResourceSnapshot;
use crate::provider::{Operation, OperationOutput};
use pw_common::OsFamily;
use pw_config::{KillSettings, OptimizerSettings};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a strategy. They are logged and the strategy skipped.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("strategy {strategy} failed: {reason}")]
    Failed {
        strategy: &'static str,
        reason: String,
    },
}

/// Everything a strategy may consult.
#[derive(Debug)]
pub struct StrategyContext<'a> {
    pub family: OsFamily,
    pub kill: &'a KillSettings,
    pub settings: &'a OptimizerSettings,
    pub history: &'a OperationHistory,
    pub cache: &'a ResultCache,
    pub resources: ResourceSnapshot,
}

/// What a strategy did to an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    /// Replace the operation with this one.
    Adjusted(Operation),
    /// Skip execution and answer with this output.
    Cached(OperationOutput),
}

/// Expected effect of a strategy relative to the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    Medium,
    High,
}

/// Registry entry as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyInfo {
    pub name: &'static str,
    pub impact: Impact,
    pub enabled: bool,
}

/// One optimization step.
pub trait Strategy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn impact(&self) -> Impact {
        Impact::Medium
    }

    fn applies_to(&self, operation: &Operation) -> bool;

    /// `Ok(None)` leaves the operation untouched.
    fn apply(
        &self,
        operation: &Operation,
        ctx: &StrategyContext<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError>;
}

#[derive(Debug, Clone)]
struct Registered {
    strategy: Arc<dyn Strategy>,
    enabled: bool,
}

/// Ordered set of strategies with per-strategy enable flags.
#[derive(Debug, Clone, Default)]
pub struct StrategyRegistry {
    entries: Vec<Registered>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a strategy, enabled. A strategy with the same name is replaced
    /// in place.
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.strategy.name() == strategy.name())
        {
            Some(existing) => existing.strategy = strategy,
            None => self.entries.push(Registered {
                strategy,
                enabled: true,
            }),
        }
    }

    /// Returns false when no strategy has that name.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.entries.iter_mut().find(|e| e.strategy.name() == name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn disable_all(&mut self) {
        for entry in &mut self.entries {
            entry.enabled = false;
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.enabled && e.strategy.name() == name)
    }

    /// Names in registry order.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.strategy.name()).collect()
    }

    /// Name, impact and enable flag of every strategy, in order.
    pub fn describe(&self) -> Vec<StrategyInfo> {
        self.entries
            .iter()
            .map(|e| StrategyInfo {
                name: e.strategy.name(),
                impact: e.strategy.impact(),
                enabled: e.enabled,
            })
            .collect()
    }

    /// Enabled strategies in registry order.
    pub fn enabled(&self) -> impl Iterator<Item = &Arc<dyn Strategy>> {
        self.entries
            .iter()
            .filter(|e| e.enabled)
            .map(|e| &e.strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Named(&'static str);

    impl Strategy for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn applies_to(&self, _operation: &Operation) -> bool {
            true
        }

        fn apply(
            &self,
            _operation: &Operation,
            _ctx: &StrategyContext<'_>,
        ) -> Result<Option<StrategyOutcome>, StrategyError> {
            Ok(None)
        }
    }

    #[test]
    fn test_registry_order_and_flags() {
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(Named("a")));
        registry.register(Arc::new(Named("b")));
        registry.register(Arc::new(Named("a")));
        assert_eq!(registry.strategy_names(), vec!["a", "b"]);

        assert!(registry.set_enabled("a", false));
        assert!(!registry.set_enabled("missing", false));
        let enabled: Vec<_> = registry.enabled().map(|s| s.name()).collect();
        assert_eq!(enabled, vec!["b"]);

        registry.disable_all();
        assert_eq!(registry.enabled().count(), 0);
        assert!(!registry.is_enabled("b"));
    }
}
