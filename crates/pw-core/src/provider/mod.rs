//! The process-control contract and its shared types.
//!
//! [`ProcessControl`] is implemented by the Unix and Windows backends and
//! wrapped by the [`facade::ProcessProvider`], which callers use. Backends
//! assume options were already normalized for their platform.

pub mod facade;
pub mod tree;
#[cfg(unix)]
pub mod unix;
pub mod windows;

use crate::collect::ProcessRecord;
use crate::detect::PlatformInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pw_common::{Error, OsFamily, Result, Signal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub use facade::{
    run_on, BackendFactory, HealthReport, OperationStats, ProcessProvider, ProviderStatistics,
};

/// How a name pattern is matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Whole-string equality.
    #[default]
    Exact,
    /// Case-insensitive regular expression.
    Regex,
}

/// Options shared by every kill operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillOptions {
    /// Signal for a direct kill. Windows collapses it into `force`.
    pub signal: Option<Signal>,
    /// Skip graceful steps entirely.
    pub force: bool,
    /// Bound for the existence re-check after a direct signal.
    #[serde(with = "option_duration_ms")]
    pub timeout: Option<Duration>,
    /// Kill descendants (deepest first) before the target.
    pub include_children: bool,
    /// Walk the graceful-to-forceful ladder.
    pub escalate: bool,
    pub batch_size: Option<usize>,
    /// Refuse a name kill that matches more processes than this.
    pub max_matches: Option<usize>,
    /// Never match the calling process or its parent.
    pub exclude_self: bool,
    pub match_mode: MatchMode,
    /// Match the pattern against the full command line as well as the name.
    pub match_command: bool,
}

impl Default for KillOptions {
    fn default() -> Self {
        Self {
            signal: None,
            force: false,
            timeout: None,
            include_children: false,
            escalate: false,
            batch_size: None,
            max_matches: None,
            exclude_self: true,
            match_mode: MatchMode::Exact,
            match_command: false,
        }
    }
}

impl KillOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn escalating() -> Self {
        Self {
            escalate: true,
            ..Self::default()
        }
    }

    /// The same options aimed at a single member of a larger kill.
    pub(crate) fn for_member(&self) -> Self {
        Self {
            include_children: false,
            ..self.clone()
        }
    }
}

/// Serialize optional durations as whole milliseconds.
mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Path a kill took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillMethod {
    /// Target was already gone; nothing was sent.
    Validation,
    Force,
    Escalate,
    Direct,
    /// One signal to a whole process group.
    Group,
    /// Members killed one at a time.
    Tree,
}

impl KillMethod {
    /// Method a kill with these options attempts.
    pub fn for_options(options: &KillOptions) -> Self {
        if options.force {
            KillMethod::Force
        } else if options.escalate {
            KillMethod::Escalate
        } else {
            KillMethod::Direct
        }
    }
}

impl std::fmt::Display for KillMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KillMethod::Validation => "validation",
            KillMethod::Force => "force",
            KillMethod::Escalate => "escalate",
            KillMethod::Direct => "direct",
            KillMethod::Group => "group",
            KillMethod::Tree => "tree",
        };
        f.write_str(s)
    }
}

/// Outcome of a single-pid kill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillResult {
    /// True only when the process is verified gone.
    pub success: bool,
    pub pid: u32,
    pub method: KillMethod,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Snapshot taken before the first signal.
    pub process_info: Option<ProcessRecord>,
    pub children_killed: usize,
    pub error: Option<String>,
    /// Session that owns the pid, when the controller knows one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl KillResult {
    /// Result for a pid that no longer exists.
    pub fn already_gone(pid: u32, duration: Duration) -> Self {
        Self {
            success: true,
            pid,
            method: KillMethod::Validation,
            duration,
            process_info: None,
            children_killed: 0,
            error: None,
            session_id: None,
        }
    }

    /// Result for a member kill that errored.
    pub fn failed(pid: u32, method: KillMethod, duration: Duration, error: &Error) -> Self {
        Self {
            success: false,
            pid,
            method,
            duration,
            process_info: None,
            children_killed: 0,
            error: Some(error.to_string()),
            session_id: None,
        }
    }

    /// Whether a signal was actually delivered and the target is gone.
    pub fn killed(&self) -> bool {
        self.success && self.method != KillMethod::Validation
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillByNameResult {
    /// True when every matched process was killed (vacuously true for none).
    pub success: bool,
    pub killed_count: usize,
    pub total_found: usize,
    pub results: Vec<KillResult>,
}

impl KillByNameResult {
    pub fn from_results(total_found: usize, results: Vec<KillResult>) -> Self {
        Self {
            success: results.iter().all(|r| r.success),
            killed_count: results.iter().filter(|r| r.killed()).count(),
            total_found,
            results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeKillResult {
    pub success: bool,
    pub killed_count: usize,
    /// Root plus every enumerated descendant.
    pub total_processes: usize,
    pub method: KillMethod,
}

/// Sort order for listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Pid,
    Name,
    /// Highest first.
    Cpu,
    /// Highest first.
    Memory,
}

impl std::str::FromStr for SortKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pid" => Ok(SortKey::Pid),
            "name" => Ok(SortKey::Name),
            "cpu" => Ok(SortKey::Cpu),
            "memory" | "mem" => Ok(SortKey::Memory),
            other => Err(Error::Validation(format!("unknown sort key '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOptions {
    /// Case-insensitive substring matched against name or command line.
    pub filter: Option<String>,
    pub sort: SortKey,
    pub limit: Option<usize>,
}

/// A point-in-time listing. Consumed by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub records: Vec<ProcessRecord>,
    /// Rows the listing tool printed that could not be parsed.
    pub skipped: usize,
    pub observed_at: DateTime<Utc>,
}

impl ProcessSnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl IntoIterator for ProcessSnapshot {
    type Item = ProcessRecord;
    type IntoIter = std::vec::IntoIter<ProcessRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Apply filter, sort and limit to raw records.
pub fn shape_listing(mut records: Vec<ProcessRecord>, options: &ListOptions) -> Vec<ProcessRecord> {
    if let Some(filter) = options.filter.as_deref().map(str::to_lowercase) {
        records.retain(|r| {
            r.name.to_lowercase().contains(&filter) || r.command.to_lowercase().contains(&filter)
        });
    }
    match options.sort {
        SortKey::Pid => records.sort_by_key(|r| r.pid),
        SortKey::Name => records.sort_by(|a, b| a.name.cmp(&b.name).then(a.pid.cmp(&b.pid))),
        SortKey::Cpu => records.sort_by(|a, b| {
            b.resources
                .cpu_percent
                .total_cmp(&a.resources.cpu_percent)
                .then(a.pid.cmp(&b.pid))
        }),
        SortKey::Memory => records.sort_by(|a, b| {
            b.resources
                .memory_bytes
                .cmp(&a.resources.memory_bytes)
                .then(a.pid.cmp(&b.pid))
        }),
    }
    if let Some(limit) = options.limit {
        records.truncate(limit);
    }
    records
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResult {
    pub success: bool,
    pub service: String,
    pub previous_state: String,
    pub final_state: String,
    pub method: KillMethod,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalResult {
    /// Whether the signal was delivered.
    pub success: bool,
    pub pid: u32,
    pub signal: Signal,
    pub error: Option<String>,
}

/// Check a pid against the family's range.
pub fn validate_pid(pid: u64, family: OsFamily) -> Result<u32> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: "pid 0 addresses the caller's process group".to_string(),
        });
    }
    if pid > family.max_pid() {
        return Err(Error::InvalidPid {
            pid,
            reason: format!("exceeds the {family} maximum of {}", family.max_pid()),
        });
    }
    u32::try_from(pid).map_err(|_| Error::InvalidPid {
        pid,
        reason: "does not fit in 32 bits".to_string(),
    })
}

/// Reject service names that could not be a unit or service name.
pub fn validate_service_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("service name is empty".to_string()));
    }
    if trimmed
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || "|&;$`<>\"'".contains(c))
    {
        return Err(Error::Validation(format!(
            "service name '{trimmed}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Kill `pids` in batches of `batch_size`, pausing between batches. Member
/// errors become failed results rather than aborting the run.
pub async fn kill_in_batches<P>(
    provider: &P,
    pids: &[u32],
    options: &KillOptions,
    batch_size: usize,
    pause: Duration,
) -> Vec<KillResult>
where
    P: ProcessControl + ?Sized,
{
    let member_options = options.for_member();
    let mut results = Vec::with_capacity(pids.len());
    let chunks: Vec<&[u32]> = pids.chunks(batch_size.max(1)).collect();

    for (index, chunk) in chunks.iter().enumerate() {
        if index > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        let outcomes = provider.kill_many(chunk, &member_options).await;
        for (pid, outcome) in chunk.iter().zip(outcomes) {
            results.push(outcome.unwrap_or_else(|e| {
                KillResult::failed(
                    *pid,
                    KillMethod::for_options(&member_options),
                    Duration::ZERO,
                    &e,
                )
            }));
        }
    }

    results
}

/// Compile a name matcher for `kill_by_name`.
pub fn compile_matcher(pattern: &str, mode: MatchMode) -> Result<NameMatcher> {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "pattern is empty".to_string(),
        });
    }
    match mode {
        MatchMode::Exact => Ok(NameMatcher::Exact(trimmed.to_string())),
        MatchMode::Regex => regex::RegexBuilder::new(trimmed)
            .case_insensitive(true)
            .build()
            .map(NameMatcher::Regex)
            .map_err(|e| Error::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            }),
    }
}

#[derive(Debug, Clone)]
pub enum NameMatcher {
    Exact(String),
    Regex(regex::Regex),
}

impl NameMatcher {
    /// Match against the record's name, and its command line when asked.
    /// Windows image names compare case-insensitively with an optional `.exe`.
    pub fn matches(&self, record: &ProcessRecord, match_command: bool, family: OsFamily) -> bool {
        match self {
            NameMatcher::Exact(want) => {
                let name_hit = match family {
                    OsFamily::Unix => record.name == *want,
                    OsFamily::Windows => {
                        let name = record.name.to_ascii_lowercase();
                        let want = want.to_ascii_lowercase();
                        name == want || name.strip_suffix(".exe") == Some(want.as_str())
                    }
                };
                name_hit || (match_command && record.command == *want)
            }
            NameMatcher::Regex(re) => {
                re.is_match(&record.name) || (match_command && re.is_match(&record.command))
            }
        }
    }
}

/// Pids a name kill must never touch.
pub fn self_pids() -> Vec<u32> {
    let mut pids = vec![std::process::id()];
    #[cfg(unix)]
    {
        let ppid = std::os::unix::process::parent_id();
        if ppid > 1 {
            pids.push(ppid);
        }
    }
    pids
}

/// Platform process-control backend.
#[async_trait]
pub trait ProcessControl: Send + Sync + std::fmt::Debug {
    /// Family this backend serves.
    fn family(&self) -> OsFamily;

    async fn kill_by_pid(&self, pid: u32, options: &KillOptions) -> Result<KillResult>;

    async fn kill_by_name(&self, pattern: &str, options: &KillOptions)
        -> Result<KillByNameResult>;

    async fn kill_process_tree(&self, root: u32, options: &KillOptions)
        -> Result<TreeKillResult>;

    async fn list_processes(&self, options: &ListOptions) -> Result<ProcessSnapshot>;

    async fn get_process_info(&self, pid: u32) -> Result<Option<ProcessRecord>>;

    async fn process_exists(&self, pid: u32) -> Result<bool>;

    async fn kill_service(&self, name: &str, options: &KillOptions) -> Result<ServiceResult>;

    /// Deliver one signal. Signal names and numbers are both accepted.
    async fn send_signal(&self, pid: u32, signal: &str) -> Result<SignalResult>;

    /// Capabilities only observable on a live backend.
    fn runtime_capabilities(&self) -> BTreeMap<String, bool>;

    /// The detection snapshot this backend was built from.
    fn platform(&self) -> &PlatformInfo;

    /// Own pid exists and a bounded listing succeeds.
    async fn self_test(&self) -> Result<()> {
        if !self.process_exists(std::process::id()).await? {
            return Err(Error::execution(
                "self_test",
                std::process::id(),
                "own process not visible",
            ));
        }
        self.list_processes(&ListOptions {
            limit: Some(1),
            ..ListOptions::default()
        })
        .await?;
        Ok(())
    }

    /// Kill several pids concurrently with the same options.
    async fn kill_many(&self, pids: &[u32], options: &KillOptions) -> Vec<Result<KillResult>> {
        futures::future::join_all(pids.iter().map(|pid| self.kill_by_pid(*pid, options))).await
    }
}

/// The eight provider operations with their parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    KillByPid { pid: u32, options: KillOptions },
    KillByName { pattern: String, options: KillOptions },
    KillProcessTree { root: u32, options: KillOptions },
    ListProcesses { options: ListOptions },
    GetProcessInfo { pid: u32 },
    ProcessExists { pid: u32 },
    KillService { name: String, options: KillOptions },
    SendSignal { pid: u32, signal: String },
}

/// Payload-free discriminant of [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    KillByPid,
    KillByName,
    KillProcessTree,
    ListProcesses,
    GetProcessInfo,
    ProcessExists,
    KillService,
    SendSignal,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        OperationKind::KillByPid,
        OperationKind::KillByName,
        OperationKind::KillProcessTree,
        OperationKind::ListProcesses,
        OperationKind::GetProcessInfo,
        OperationKind::ProcessExists,
        OperationKind::KillService,
        OperationKind::SendSignal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::KillByPid => "kill_by_pid",
            OperationKind::KillByName => "kill_by_name",
            OperationKind::KillProcessTree => "kill_process_tree",
            OperationKind::ListProcesses => "list_processes",
            OperationKind::GetProcessInfo => "get_process_info",
            OperationKind::ProcessExists => "process_exists",
            OperationKind::KillService => "kill_service",
            OperationKind::SendSignal => "send_signal",
        }
    }

    /// Operations that change process state.
    pub fn is_kill(&self) -> bool {
        matches!(
            self,
            OperationKind::KillByPid
                | OperationKind::KillByName
                | OperationKind::KillProcessTree
                | OperationKind::KillService
                | OperationKind::SendSignal
        )
    }

    /// Operations whose results may be served from a cache.
    pub fn is_cacheable_read(&self) -> bool {
        matches!(
            self,
            OperationKind::ListProcesses | OperationKind::GetProcessInfo
        )
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::KillByPid { .. } => OperationKind::KillByPid,
            Operation::KillByName { .. } => OperationKind::KillByName,
            Operation::KillProcessTree { .. } => OperationKind::KillProcessTree,
            Operation::ListProcesses { .. } => OperationKind::ListProcesses,
            Operation::GetProcessInfo { .. } => OperationKind::GetProcessInfo,
            Operation::ProcessExists { .. } => OperationKind::ProcessExists,
            Operation::KillService { .. } => OperationKind::KillService,
            Operation::SendSignal { .. } => OperationKind::SendSignal,
        }
    }

    /// Kill options carried by the operation, if it has any.
    pub fn kill_options(&self) -> Option<&KillOptions> {
        match self {
            Operation::KillByPid { options, .. }
            | Operation::KillByName { options, .. }
            | Operation::KillProcessTree { options, .. }
            | Operation::KillService { options, .. } => Some(options),
            _ => None,
        }
    }

    pub fn kill_options_mut(&mut self) -> Option<&mut KillOptions> {
        match self {
            Operation::KillByPid { options, .. }
            | Operation::KillByName { options, .. }
            | Operation::KillProcessTree { options, .. }
            | Operation::KillService { options, .. } => Some(options),
            _ => None,
        }
    }

    /// Pid the operation targets directly, if any.
    pub fn target_pid(&self) -> Option<u32> {
        match self {
            Operation::KillByPid { pid, .. }
            | Operation::GetProcessInfo { pid }
            | Operation::ProcessExists { pid }
            | Operation::SendSignal { pid, .. } => Some(*pid),
            Operation::KillProcessTree { root, .. } => Some(*root),
            _ => None,
        }
    }

    /// Human-readable target for error messages.
    pub fn target(&self) -> String {
        match self {
            Operation::KillByName { pattern, .. } => pattern.clone(),
            Operation::KillService { name, .. } => name.clone(),
            Operation::ListProcesses { .. } => "all".to_string(),
            other => other
                .target_pid()
                .map(|p| p.to_string())
                .unwrap_or_default(),
        }
    }

    /// Stable key with volatile fields stripped, for caches and batching.
    ///
    /// Timeouts and batch sizes are tuning knobs that do not change what a
    /// read returns, so they do not take part.
    pub fn cache_key(&self) -> String {
        match self {
            Operation::ListProcesses { options } => format!(
                "{}|filter={}|sort={:?}|limit={}",
                self.kind(),
                options.filter.as_deref().unwrap_or(""),
                options.sort,
                options.limit.map(|l| l.to_string()).unwrap_or_default()
            ),
            Operation::GetProcessInfo { pid } | Operation::ProcessExists { pid } => {
                format!("{}|pid={pid}", self.kind())
            }
            other => format!("{}|target={}", other.kind(), other.target()),
        }
    }
}

/// Typed result of one [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum OperationOutput {
    Kill(KillResult),
    KillByName(KillByNameResult),
    Tree(TreeKillResult),
    Processes(ProcessSnapshot),
    ProcessInfo(Option<ProcessRecord>),
    Exists(bool),
    Service(ServiceResult),
    Signal(SignalResult),
}

impl OperationOutput {
    /// Whether the operation achieved its goal.
    pub fn succeeded(&self) -> bool {
        match self {
            OperationOutput::Kill(r) => r.success,
            OperationOutput::KillByName(r) => r.success,
            OperationOutput::Tree(r) => r.success,
            OperationOutput::Service(r) => r.success,
            OperationOutput::Signal(r) => r.success,
            OperationOutput::Processes(_)
            | OperationOutput::ProcessInfo(_)
            | OperationOutput::Exists(_) => true,
        }
    }

    /// Pids the output reports as killed.
    pub fn killed_pids(&self) -> Vec<u32> {
        match self {
            OperationOutput::Kill(r) if r.killed() => vec![r.pid],
            OperationOutput::KillByName(r) => r
                .results
                .iter()
                .filter(|k| k.killed())
                .map(|k| k.pid)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Shared wait loop: poll `exists` until it reports false or `limit` passes.
pub(crate) async fn wait_until_gone<F, Fut>(limit: Duration, poll: Duration, mut exists: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if !exists().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll.max(Duration::from_millis(1))).await;
    }
}
