//! Parsers for `tasklist` and `wmic` output.
//!
//! These are plain text transforms so they compile and are tested on every
//! host; only the provider that feeds them is Windows-specific at runtime.

use super::types::{ParsedListing, ProcessRecord, ProcessState, ResourceUsage};
use chrono::{DateTime, Utc};
use tracing::trace;

/// Split one CSV line, honouring double quotes and `""` escapes.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parse `tasklist /V /FO CSV /NH` output.
///
/// Columns: image name, PID, session name, session#, mem usage, status,
/// user name, CPU time, window title. Non-verbose output (five columns) is
/// accepted too.
pub fn parse_tasklist_csv(output: &str, observed_at: DateTime<Utc>) -> ParsedListing {
    let mut listing = ParsedListing::default();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || is_informational(line) {
            continue;
        }
        match parse_tasklist_row(line, observed_at) {
            Some(record) => listing.records.push(record),
            None => {
                trace!(line, "skipping unparseable tasklist row");
                listing.skipped += 1;
            }
        }
    }

    listing
}

/// `tasklist` prints this instead of CSV when a filter matches nothing.
fn is_informational(line: &str) -> bool {
    line.starts_with("INFO:")
}

fn parse_tasklist_row(line: &str, observed_at: DateTime<Utc>) -> Option<ProcessRecord> {
    let fields = split_csv_line(line);
    if fields.len() < 5 {
        return None;
    }
    let name = fields[0].trim().to_string();
    if name.is_empty() {
        return None;
    }
    let pid: u32 = fields[1].trim().parse().ok()?;
    let memory_bytes = parse_mem_usage(&fields[4]).unwrap_or(0);

    let state = fields
        .get(5)
        .map(|s| ProcessState::from_windows_status(s))
        .unwrap_or(ProcessState::Running);
    let owner = fields
        .get(6)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && *s != "N/A")
        .map(str::to_string);

    Some(ProcessRecord {
        pid,
        ppid: None,
        command: name.clone(),
        name,
        owner,
        resources: ResourceUsage {
            cpu_percent: 0.0,
            memory_bytes,
        },
        state,
        tty: None,
        observed_at,
    })
}

/// Parse a `Mem Usage` cell such as `123,456 K` (separators vary by locale).
pub fn parse_mem_usage(cell: &str) -> Option<u64> {
    let digits: String = cell.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let kb: u64 = digits.parse().ok()?;
    Some(kb.saturating_mul(1024))
}

/// Pids present in `tasklist /FI "PID eq n" /FO CSV /NH` output.
pub fn tasklist_pids(output: &str) -> Vec<u32> {
    parse_tasklist_csv(output, Utc::now())
        .records
        .into_iter()
        .map(|r| r.pid)
        .collect()
}

/// Arguments for `wmic process get ... /format:csv`.
pub fn wmic_process_args() -> Vec<String> {
    [
        "process",
        "get",
        "CommandLine,Name,ParentProcessId,ProcessId,WorkingSetSize",
        "/format:csv",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Arguments for a PowerShell listing of `pid ppid` pairs, used where
/// `wmic` has been removed.
pub fn powershell_linkage_args() -> Vec<String> {
    [
        "-NoProfile",
        "-NonInteractive",
        "-Command",
        "Get-CimInstance Win32_Process | ForEach-Object { \"$($_.ProcessId) $($_.ParentProcessId)\" }",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Parse `wmic process get CommandLine,Name,ParentProcessId,ProcessId,WorkingSetSize /format:csv`.
///
/// wmic orders columns alphabetically and does not quote fields, so the
/// command line (which may contain commas) is recovered by taking the fixed
/// columns from the right.
pub fn parse_wmic_csv(output: &str, observed_at: DateTime<Utc>) -> ParsedListing {
    let mut listing = ParsedListing::default();

    for line in output.lines() {
        let line = line.trim_matches(|c: char| c == '\r' || c.is_whitespace());
        if line.is_empty() || line.starts_with("Node,") {
            continue;
        }
        match parse_wmic_row(line, observed_at) {
            Some(record) => listing.records.push(record),
            None => {
                trace!(line, "skipping unparseable wmic row");
                listing.skipped += 1;
            }
        }
    }

    listing
}

fn parse_wmic_row(line: &str, observed_at: DateTime<Utc>) -> Option<ProcessRecord> {
    // Node,CommandLine...,Name,ParentProcessId,ProcessId,WorkingSetSize
    let mut tail = line.rsplitn(5, ',');
    let working_set = tail.next()?.trim();
    let pid: u32 = tail.next()?.trim().parse().ok()?;
    let ppid: u32 = tail.next()?.trim().parse().ok()?;
    let name = tail.next()?.trim().to_string();
    let head = tail.next()?;
    let command = head.split_once(',').map(|(_, cmd)| cmd.trim()).unwrap_or("");

    if name.is_empty() {
        return None;
    }

    Some(ProcessRecord {
        pid,
        ppid: Some(ppid),
        command: if command.is_empty() {
            name.clone()
        } else {
            command.to_string()
        },
        name,
        owner: None,
        resources: ResourceUsage {
            cpu_percent: 0.0,
            memory_bytes: working_set.parse().unwrap_or(0),
        },
        state: ProcessState::Running,
        tty: None,
        observed_at,
    })
}

/// Service state reported by `sc query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    StopPending,
    StartPending,
    Paused,
    Unknown,
}

impl ServiceState {
    pub fn is_inactive(&self) -> bool {
        matches!(self, ServiceState::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::StopPending => "stop_pending",
            ServiceState::StartPending => "start_pending",
            ServiceState::Paused => "paused",
            ServiceState::Unknown => "unknown",
        }
    }
}

/// Extract the `STATE` line from `sc query <name>` output.
pub fn parse_sc_state(output: &str) -> ServiceState {
    let Some(line) = output.lines().find(|l| l.trim_start().starts_with("STATE")) else {
        return ServiceState::Unknown;
    };
    if line.contains("STOP_PENDING") {
        ServiceState::StopPending
    } else if line.contains("START_PENDING") {
        ServiceState::StartPending
    } else if line.contains("RUNNING") {
        ServiceState::Running
    } else if line.contains("STOPPED") {
        ServiceState::Stopped
    } else if line.contains("PAUSED") {
        ServiceState::Paused
    } else {
        ServiceState::Unknown
    }
}

/// Extract the `PID` line from `sc queryex <name>` output.
pub fn parse_sc_pid(output: &str) -> Option<u32> {
    output
        .lines()
        .find(|l| l.trim_start().starts_with("PID"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse().ok())
        .filter(|pid| *pid != 0)
}
