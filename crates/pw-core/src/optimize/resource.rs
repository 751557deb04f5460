//! Host resource pressure.

use serde::Serialize;
use std::sync::Mutex;
use sysinfo::System;

/// CPU and memory load, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub cpu: f64,
    pub memory: f64,
}

impl ResourceSnapshot {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self {
            cpu: cpu.clamp(0.0, 1.0),
            memory: memory.clamp(0.0, 1.0),
        }
    }

    /// The worse of the two signals.
    pub fn pressure(&self) -> f64 {
        self.cpu.max(self.memory)
    }
}

/// Source of resource pressure for the optimizer.
pub trait ResourceMonitor: Send + Sync + std::fmt::Debug {
    fn sample(&self) -> ResourceSnapshot;
}

/// [`ResourceMonitor`] backed by `sysinfo`.
///
/// CPU usage is measured between consecutive samples, so the first sample
/// reports zero CPU.
pub struct SysinfoMonitor {
    system: Mutex<System>,
}

impl std::fmt::Debug for SysinfoMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoMonitor").finish_non_exhaustive()
    }
}

impl Default for SysinfoMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl ResourceMonitor for SysinfoMonitor {
    fn sample(&self) -> ResourceSnapshot {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_memory();
        system.refresh_cpu();
        let cpu = f64::from(system.global_cpu_info().cpu_usage()) / 100.0;
        let memory = match system.total_memory() {
            0 => 0.0,
            total => system.used_memory() as f64 / total as f64,
        };
        ResourceSnapshot::new(cpu, memory)
    }
}

/// Constant pressure, for tests and for hosts where sampling is unwanted.
#[derive(Debug, Default)]
pub struct FixedMonitor {
    snapshot: Mutex<ResourceSnapshot>,
}

impl FixedMonitor {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self {
            snapshot: Mutex::new(ResourceSnapshot::new(cpu, memory)),
        }
    }

    pub fn set(&self, cpu: f64, memory: f64) {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) =
            ResourceSnapshot::new(cpu, memory);
    }
}

impl ResourceMonitor for FixedMonitor {
    fn sample(&self) -> ResourceSnapshot {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_is_the_worse_signal() {
        let snapshot = ResourceSnapshot::new(0.2, 0.9);
        assert!((snapshot.pressure() - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_clamps() {
        let snapshot = ResourceSnapshot::new(1.7, -0.3);
        assert_eq!(snapshot, ResourceSnapshot::new(1.0, 0.0));
    }

    #[test]
    fn test_sysinfo_sample_in_range() {
        let monitor = SysinfoMonitor::new();
        let snapshot = monitor.sample();
        assert!((0.0..=1.0).contains(&snapshot.cpu));
        assert!((0.0..=1.0).contains(&snapshot.memory));
    }

    #[test]
    fn test_fixed_monitor_updates() {
        let monitor = FixedMonitor::new(0.1, 0.1);
        monitor.set(0.95, 0.2);
        assert!(monitor.sample().pressure() > 0.9);
    }
}
