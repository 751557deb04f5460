//! Common types for process listing and lookup.
//!
//! These types are point-in-time OS snapshots: they carry no identity beyond
//! pid plus observation time and are never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process state as reported by the platform.
///
/// Maps to standard Unix process states:
/// - R: Running or runnable
/// - S: Interruptible sleep (waiting for event)
/// - D: Uninterruptible sleep (usually I/O)
/// - Z: Zombie (terminated but not reaped)
/// - T: Stopped (by job control or trace)
/// - I: Idle (kernel thread, Linux)
/// - X: Dead (should never be seen)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    Zombie,
    Idle,
    Dead,
    Unknown,
}

impl ProcessState {
    /// Parse process state from single character.
    pub fn from_char(c: char) -> Self {
        match c {
            'R' => ProcessState::Running,
            'S' => ProcessState::Sleeping,
            'D' | 'U' => ProcessState::DiskSleep,
            'Z' => ProcessState::Zombie,
            'T' | 't' => ProcessState::Stopped,
            'I' => ProcessState::Idle,
            'X' | 'x' => ProcessState::Dead,
            _ => ProcessState::Unknown,
        }
    }

    /// Map a `tasklist /V` status column.
    pub fn from_windows_status(status: &str) -> Self {
        match status.trim() {
            "Running" => ProcessState::Running,
            "Not Responding" => ProcessState::Stopped,
            _ => ProcessState::Unknown,
        }
    }

    /// Whether this state indicates a zombie process.
    pub fn is_zombie(&self) -> bool {
        matches!(self, ProcessState::Zombie)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessState::Running => "running",
            ProcessState::Sleeping => "sleeping",
            ProcessState::DiskSleep => "disk_sleep",
            ProcessState::Stopped => "stopped",
            ProcessState::Zombie => "zombie",
            ProcessState::Idle => "idle",
            ProcessState::Dead => "dead",
            ProcessState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// CPU and memory usage at observation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage percentage (0-100 per core, as reported by the tool).
    pub cpu_percent: f64,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
}

/// One process as seen by a listing or lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    /// Parent pid, when the platform tool reports it.
    pub ppid: Option<u32>,
    /// Short executable name.
    pub name: String,
    /// Full command line (falls back to the name when unavailable).
    pub command: String,
    pub owner: Option<String>,
    pub resources: ResourceUsage,
    pub state: ProcessState,
    pub tty: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Result of parsing a listing tool's output.
#[derive(Debug, Clone, Default)]
pub struct ParsedListing {
    pub records: Vec<ProcessRecord>,
    /// Rows that could not be parsed and were skipped.
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_state_from_char() {
        assert_eq!(ProcessState::from_char('R'), ProcessState::Running);
        assert_eq!(ProcessState::from_char('S'), ProcessState::Sleeping);
        assert_eq!(ProcessState::from_char('Z'), ProcessState::Zombie);
        assert_eq!(ProcessState::from_char('t'), ProcessState::Stopped);
        assert_eq!(ProcessState::from_char('?'), ProcessState::Unknown);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ProcessState::DiskSleep).unwrap();
        assert_eq!(json, "\"disk_sleep\"");
        assert_eq!(ProcessState::DiskSleep.to_string(), "disk_sleep");
    }

    #[test]
    fn test_windows_status() {
        assert_eq!(
            ProcessState::from_windows_status("Running"),
            ProcessState::Running
        );
        assert_eq!(
            ProcessState::from_windows_status("Not Responding"),
            ProcessState::Stopped
        );
        assert_eq!(
            ProcessState::from_windows_status("Unknown"),
            ProcessState::Unknown
        );
    }
}
