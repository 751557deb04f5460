//! `ps` invocation and output parsing for Unix-family hosts.
//!
//! The column set is fixed and header-free:
//! `pid ppid user stat pcpu rss tty args`. `args` is last so embedded spaces
//! survive whitespace splitting of the earlier columns.

use super::types::{ParsedListing, ProcessRecord, ProcessState, ResourceUsage};
use chrono::{DateTime, Utc};
use tracing::trace;

/// Arguments selecting the fixed column set, without a pid filter.
pub const PS_COLUMNS: &[&str] = &[
    "-ww", "-o", "pid=", "-o", "ppid=", "-o", "user=", "-o", "stat=", "-o", "pcpu=", "-o",
    "rss=", "-o", "tty=", "-o", "args=",
];

const FIXED_FIELDS: usize = 7;

/// Arguments for listing every process.
pub fn list_all_args() -> Vec<String> {
    let mut args = vec!["-A".to_string()];
    args.extend(PS_COLUMNS.iter().map(|s| s.to_string()));
    args
}

/// Arguments for looking up one pid.
pub fn single_pid_args(pid: u32) -> Vec<String> {
    let mut args = vec!["-p".to_string(), pid.to_string()];
    args.extend(PS_COLUMNS.iter().map(|s| s.to_string()));
    args
}

/// Arguments for a cheap pid/ppid-only listing used by tree traversal.
pub fn linkage_args() -> Vec<String> {
    ["-A", "-o", "pid=", "-o", "ppid="]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Parse full `ps` output, skipping rows that do not parse.
pub fn parse_ps_output(output: &str, observed_at: DateTime<Utc>) -> ParsedListing {
    let mut listing = ParsedListing::default();

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || is_header_line(trimmed) {
            continue;
        }
        match parse_ps_line(trimmed, observed_at) {
            Ok(record) => listing.records.push(record),
            Err(reason) => {
                trace!(line = trimmed, reason, "skipping unparseable ps row");
                listing.skipped += 1;
            }
        }
    }

    listing
}

/// Parse `pid ppid` pairs, skipping malformed rows.
pub fn parse_linkage(output: &str) -> Vec<(u32, u32)> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse().ok()?;
            let ppid = parts.next()?.parse().ok()?;
            Some((pid, ppid))
        })
        .collect()
}

fn is_header_line(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some("PID"), Some("PPID")) | (Some("pid"), Some("ppid"))
    )
}

fn parse_ps_line(line: &str, observed_at: DateTime<Utc>) -> Result<ProcessRecord, &'static str> {
    let mut fields = Vec::with_capacity(FIXED_FIELDS);
    let mut rest = line;
    for _ in 0..FIXED_FIELDS {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        if end == 0 {
            return Err("insufficient fields");
        }
        fields.push(&rest[..end]);
        rest = &rest[end..];
    }
    let args = rest.trim();

    let pid: u32 = fields[0].parse().map_err(|_| "invalid pid")?;
    let ppid: u32 = fields[1].parse().map_err(|_| "invalid ppid")?;
    let user = fields[2];

    // State may carry modifiers (Ss, R+, S<l)
    let state = fields[3]
        .chars()
        .next()
        .map(ProcessState::from_char)
        .unwrap_or(ProcessState::Unknown);

    let cpu_percent: f64 = fields[4].parse().map_err(|_| "invalid pcpu")?;
    let rss_kb: u64 = fields[5].parse().map_err(|_| "invalid rss")?;

    let tty = match fields[6] {
        "?" | "-" | "??" => None,
        other => Some(other.to_string()),
    };

    if args.is_empty() {
        return Err("missing command");
    }
    let name = name_from_args(args);

    Ok(ProcessRecord {
        pid,
        ppid: if ppid == 0 && pid <= 1 { None } else { Some(ppid) },
        name,
        command: args.to_string(),
        owner: Some(user.to_string()),
        resources: ResourceUsage {
            cpu_percent,
            memory_bytes: rss_kb.saturating_mul(1024),
        },
        state,
        tty,
        observed_at,
    })
}

/// Derive the short process name from a command line.
///
/// Kernel threads appear as `[kthreadd]`; everything else uses the basename
/// of the first word.
pub fn name_from_args(args: &str) -> String {
    let args = args.trim();
    if let Some(inner) = args.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return inner.to_string();
    }
    let first = args.split_whitespace().next().unwrap_or("");
    let base = first.rsplit('/').next().unwrap_or(first);
    base.trim_end_matches(':').to_string()
}
