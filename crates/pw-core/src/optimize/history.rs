//! Bounded per-operation history.

use crate::provider::OperationKind;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryEntry {
    pub duration: Duration,
    pub success: bool,
}

/// Aggregate view of one kind's recent history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KindSummary {
    pub samples: usize,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub success_rate: f64,
}

/// Rolling window of the last `capacity` outcomes per operation kind.
#[derive(Debug, Clone)]
pub struct OperationHistory {
    capacity: usize,
    entries: BTreeMap<OperationKind, VecDeque<HistoryEntry>>,
}

impl OperationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, kind: OperationKind, entry: HistoryEntry) {
        let window = self.entries.entry(kind).or_default();
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(entry);
    }

    pub fn len(&self, kind: OperationKind) -> usize {
        self.entries.get(&kind).map_or(0, VecDeque::len)
    }

    pub fn summary(&self, kind: OperationKind) -> Option<KindSummary> {
        let window = self.entries.get(&kind).filter(|w| !w.is_empty())?;
        let samples = window.len();
        let millis = window.iter().map(|e| e.duration.as_secs_f64() * 1000.0);
        let total: f64 = millis.clone().sum();
        let max_ms = millis.fold(0.0, f64::max);
        let successes = window.iter().filter(|e| e.success).count();
        Some(KindSummary {
            samples,
            avg_ms: total / samples as f64,
            max_ms,
            success_rate: successes as f64 / samples as f64,
        })
    }

    pub fn summaries(&self) -> BTreeMap<OperationKind, KindSummary> {
        self.entries
            .keys()
            .filter_map(|kind| self.summary(*kind).map(|s| (*kind, s)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ms: u64, success: bool) -> HistoryEntry {
        HistoryEntry {
            duration: Duration::from_millis(ms),
            success,
        }
    }

    #[test]
    fn test_window_is_bounded() {
        let mut history = OperationHistory::new(3);
        for ms in [10, 20, 30, 40] {
            history.record(OperationKind::ListProcesses, entry(ms, true));
        }
        assert_eq!(history.len(OperationKind::ListProcesses), 3);
        let summary = history.summary(OperationKind::ListProcesses).unwrap();
        assert!((summary.avg_ms - 30.0).abs() < 1e-9);
        assert!((summary.max_ms - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_success_rate() {
        let mut history = OperationHistory::new(10);
        history.record(OperationKind::KillByPid, entry(5, true));
        history.record(OperationKind::KillByPid, entry(5, false));
        let summary = history.summary(OperationKind::KillByPid).unwrap();
        assert!((summary.success_rate - 0.5).abs() < 1e-9);
        assert!(history.summary(OperationKind::SendSignal).is_none());
    }
}
