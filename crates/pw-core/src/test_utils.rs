//! Test utilities for pw-core.
//!
//! This module provides test infrastructure including:
//! - A scripted [`CommandRunner`] that answers by program and argument prefix
//! - A fake signal table for the Unix backend
//! - An in-memory [`ProcessControl`] backend for facade and optimizer tests
//! - A harness for spawning real processes

use crate::collect::{
    CommandRunner, ProcessRecord, ProcessState, ResourceUsage, ToolError, ToolOutput, ToolSpec,
};
use crate::detect::{
    confidence_for, derive_capabilities, CpuInfo, OsVersion, PlatformDetector, PlatformInfo,
    ToolInfo,
};
use crate::provider::{
    compile_matcher, shape_listing, tree, KillByNameResult, KillMethod, KillOptions, KillResult,
    ListOptions, OperationKind, ProcessControl, ProcessProvider, ProcessSnapshot, ServiceResult,
    SignalResult, TreeKillResult,
};
use async_trait::async_trait;
use chrono::Utc;
use pw_common::{Error, OsFamily, Result, Signal};
use pw_config::{DetectorSettings, ProcwardConfig};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ============================================================================
// Scripted command runner
// ============================================================================

/// Canned reply for one command invocation.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Output {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    NotFound,
    Timeout,
}

impl ScriptedResponse {
    /// Exit 0 with `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        ScriptedResponse::Output {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Non-zero exit with `stderr`.
    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        ScriptedResponse::Output {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Non-zero exit that still prints to stdout (`systemctl is-active`).
    pub fn exit_with_stdout(code: i32, stdout: impl Into<String>) -> Self {
        ScriptedResponse::Output {
            exit_code: code,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn not_found() -> Self {
        ScriptedResponse::NotFound
    }

    pub fn timeout() -> Self {
        ScriptedResponse::Timeout
    }

    fn render(&self, spec: &ToolSpec) -> std::result::Result<ToolOutput, ToolError> {
        match self {
            ScriptedResponse::Output {
                exit_code,
                stdout,
                stderr,
            } => Ok(ToolOutput {
                command: spec.command.clone(),
                args: spec.args.clone(),
                stdout: stdout.clone().into_bytes(),
                stderr: stderr.clone().into_bytes(),
                exit_code: Some(*exit_code),
                ..ToolOutput::default()
            }),
            ScriptedResponse::NotFound => Err(ToolError::CommandNotFound(spec.command.clone())),
            ScriptedResponse::Timeout => Err(ToolError::Timeout(
                spec.timeout.unwrap_or(Duration::from_secs(1)),
            )),
        }
    }
}

#[derive(Debug)]
struct Rule {
    program: String,
    prefix: Vec<String>,
    responses: VecDeque<ScriptedResponse>,
}

/// [`CommandRunner`] that answers from registered rules.
///
/// A rule matches when the program is equal and its argument list is a
/// prefix of the call's. The longest prefix wins; among equals the later
/// registration wins. A sequence is consumed front to back and its last
/// response repeats. Unmatched calls fail as if the program were missing.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<ToolSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, program: &str, prefix: &[&str], response: ScriptedResponse) -> Self {
        self.on_sequence(program, prefix, vec![response])
    }

    pub fn on_sequence(
        self,
        program: &str,
        prefix: &[&str],
        responses: Vec<ScriptedResponse>,
    ) -> Self {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Rule {
                program: program.to_string(),
                prefix: prefix.iter().map(|s| s.to_string()).collect(),
                responses: responses.into(),
            });
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn calls_to(&self, program: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.command == program)
            .count()
    }

    pub fn calls(&self) -> Vec<ToolSpec> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &ToolSpec) -> std::result::Result<ToolOutput, ToolError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());

        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let best = rules
            .iter_mut()
            .enumerate()
            .filter(|(_, r)| r.program == spec.command && spec.args.starts_with(&r.prefix))
            .max_by_key(|(index, r)| (r.prefix.len(), *index))
            .map(|(_, r)| r);

        let Some(rule) = best else {
            return Err(ToolError::CommandNotFound(spec.command.clone()));
        };
        let response = if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        };
        match response {
            Some(r) => r.render(spec),
            None => Err(ToolError::CommandNotFound(spec.command.clone())),
        }
    }
}

// ============================================================================
// Fake signal table
// ============================================================================

#[cfg(unix)]
pub use fake_signals::FakeSignals;

#[cfg(unix)]
mod fake_signals {
    use crate::provider::unix::{SignalDelivery, SignalError};
    use std::collections::{BTreeMap, BTreeSet, HashSet};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Table {
        alive: BTreeSet<u32>,
        ignored: HashSet<(u32, i32)>,
        denied: HashSet<u32>,
        groups: BTreeMap<u32, u32>,
        sent: Vec<(u32, i32)>,
        group_sent: Vec<(u32, i32)>,
    }

    /// In-memory process table for [`SignalDelivery`].
    ///
    /// Terminating signals remove the target unless it ignores them; SIGKILL
    /// cannot be ignored. Denied pids reject everything.
    #[derive(Debug, Default)]
    pub struct FakeSignals {
        table: Mutex<Table>,
    }

    fn terminates(signal: i32) -> bool {
        matches!(
            signal,
            libc::SIGTERM | libc::SIGINT | libc::SIGQUIT | libc::SIGHUP | libc::SIGKILL
        )
    }

    impl FakeSignals {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_alive(self, pids: impl IntoIterator<Item = u32>) -> Self {
            self.lock().alive.extend(pids);
            self
        }

        pub fn ignore(&self, pid: u32, signal: i32) {
            self.lock().ignored.insert((pid, signal));
        }

        pub fn deny(&self, pid: u32) {
            self.lock().denied.insert(pid);
        }

        pub fn set_group(&self, pid: u32, pgid: u32) {
            self.lock().groups.insert(pid, pgid);
        }

        pub fn sent(&self) -> Vec<(u32, i32)> {
            self.lock().sent.clone()
        }

        pub fn group_sent(&self) -> Vec<(u32, i32)> {
            self.lock().group_sent.clone()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
            self.table.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    impl Table {
        fn deliver(&mut self, pid: u32, signal: i32) -> bool {
            let ignored = signal != libc::SIGKILL && self.ignored.contains(&(pid, signal));
            if terminates(signal) && !ignored {
                self.alive.remove(&pid);
                return true;
            }
            false
        }
    }

    impl SignalDelivery for FakeSignals {
        fn signal(&self, pid: u32, signal: i32) -> Result<(), SignalError> {
            let mut table = self.lock();
            if table.denied.contains(&pid) {
                return Err(SignalError::PermissionDenied);
            }
            if !table.alive.contains(&pid) {
                return Err(SignalError::NoSuchProcess);
            }
            table.sent.push((pid, signal));
            table.deliver(pid, signal);
            Ok(())
        }

        fn signal_group(&self, pgid: u32, signal: i32) -> Result<(), SignalError> {
            let mut table = self.lock();
            let members: Vec<u32> = table
                .groups
                .iter()
                .filter(|(pid, group)| **group == pgid && table.alive.contains(*pid))
                .map(|(pid, _)| *pid)
                .collect();
            if members.is_empty() {
                return Err(SignalError::NoSuchProcess);
            }
            table.group_sent.push((pgid, signal));
            for pid in members {
                if !table.denied.contains(&pid) {
                    table.deliver(pid, signal);
                }
            }
            Ok(())
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.lock().alive.contains(&pid)
        }

        fn process_group(&self, pid: u32) -> Option<u32> {
            self.lock().groups.get(&pid).copied()
        }

        fn own_process_group(&self) -> Option<u32> {
            Some(u32::MAX)
        }
    }
}

// ============================================================================
// Platform fixtures
// ============================================================================

/// A detection snapshot with exactly `tools` present.
pub fn platform_info(family: OsFamily, tools: &[&str], group_probe: bool) -> PlatformInfo {
    let tool_map: BTreeMap<String, ToolInfo> = tools
        .iter()
        .map(|name| {
            (
                name.to_string(),
                ToolInfo::found(format!("/usr/bin/{name}"), None),
            )
        })
        .collect();
    let capabilities = derive_capabilities(family, &tool_map, group_probe);
    let settings = DetectorSettings::default();
    let confidence = confidence_for(
        family,
        &tool_map,
        &capabilities,
        settings.confidence_tool_weight,
        settings.confidence_capability_weight,
    );
    let platform = match family {
        OsFamily::Unix => "linux",
        OsFamily::Windows => "windows",
    };
    PlatformInfo {
        platform: platform.to_string(),
        family,
        os_version: OsVersion {
            version: "fixture".to_string(),
            source: "test".to_string(),
        },
        arch: std::env::consts::ARCH.to_string(),
        cpu: CpuInfo {
            logical_cores: 4,
            brand: None,
        },
        shells: vec!["sh".to_string()],
        tools: tool_map,
        capabilities,
        performance: BTreeMap::new(),
        hints: Vec::new(),
        confidence,
        detected_at: Utc::now(),
    }
}

/// A detector that finds every tool it asks `which`/`where` about and runs
/// no probes or benchmarks.
pub fn scripted_detector(family: OsFamily) -> Arc<PlatformDetector> {
    let runner = Arc::new(
        ScriptedRunner::new()
            .on("which", &[], ScriptedResponse::ok("/usr/bin/tool\n"))
            .on("where", &[], ScriptedResponse::ok("C:\\Windows\\System32\\tool.exe\r\n")),
    );
    let settings = DetectorSettings {
        probe_process_group: false,
        run_benchmarks: false,
        ..DetectorSettings::default()
    };
    let platform = match family {
        OsFamily::Unix => "linux",
        OsFamily::Windows => "windows",
    };
    Arc::new(PlatformDetector::new(runner, settings).with_platform(platform))
}

/// A facade over a fresh [`FakeBackend`] for `family`.
pub fn fake_provider(
    family: OsFamily,
    config: ProcwardConfig,
) -> (ProcessProvider, Arc<FakeBackend>) {
    let backend = Arc::new(FakeBackend::new(family));
    let shared = Arc::clone(&backend);
    let provider = ProcessProvider::with_detector(
        scripted_detector(family),
        Arc::new(ScriptedRunner::new()),
        Arc::new(config),
    )
    .with_backend_factory(Arc::new(move |_platform| {
        Ok(Arc::clone(&shared) as Arc<dyn ProcessControl>)
    }));
    (provider, backend)
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Default)]
struct FakeState {
    processes: BTreeMap<u32, ProcessRecord>,
    calls: HashMap<OperationKind, usize>,
    batches: Vec<Vec<u32>>,
    fail_next: usize,
    self_tests: usize,
    runtime: BTreeMap<String, bool>,
    latency: Duration,
}

/// [`ProcessControl`] over an in-memory process table.
///
/// Kills remove processes immediately. Every operation is counted, and
/// `fail_next` makes the next calls fail with an execution error.
#[derive(Debug)]
pub struct FakeBackend {
    family: OsFamily,
    platform: PlatformInfo,
    state: Mutex<FakeState>,
}

pub fn fake_record(pid: u32, ppid: u32, name: &str) -> ProcessRecord {
    ProcessRecord {
        pid,
        ppid: Some(ppid),
        name: name.to_string(),
        command: format!("/usr/bin/{name}"),
        owner: Some("tester".to_string()),
        resources: ResourceUsage {
            cpu_percent: 0.5,
            memory_bytes: 4096,
        },
        state: ProcessState::Sleeping,
        tty: None,
        observed_at: Utc::now(),
    }
}

impl FakeBackend {
    pub fn new(family: OsFamily) -> Self {
        let tools: &[&str] = match family {
            OsFamily::Unix => &["ps", "kill", "pgrep", "pkill", "systemctl"],
            OsFamily::Windows => &["tasklist", "taskkill", "wmic", "sc"],
        };
        Self {
            family,
            platform: platform_info(family, tools, true),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_process(&self, pid: u32, ppid: u32, name: &str) {
        self.lock().processes.insert(pid, fake_record(pid, ppid, name));
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.lock().processes.contains_key(&pid)
    }

    /// Fail the next `n` operations.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn set_runtime_flag(&self, name: &str, value: bool) {
        self.lock().runtime.insert(name.to_string(), value);
    }

    pub fn calls_of(&self, kind: OperationKind) -> usize {
        self.lock().calls.get(&kind).copied().unwrap_or(0)
    }

    /// Pid groups passed to `kill_many`, in call order.
    pub fn batches(&self) -> Vec<Vec<u32>> {
        self.lock().batches.clone()
    }

    pub fn self_test_count(&self) -> usize {
        self.lock().self_tests
    }

    async fn enter(&self, kind: OperationKind) -> Result<()> {
        let latency = {
            let mut state = self.lock();
            *state.calls.entry(kind).or_default() += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(Error::execution(kind.as_str(), "fake", "injected failure"));
            }
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn remove(&self, pid: u32) -> Option<ProcessRecord> {
        self.lock().processes.remove(&pid)
    }

    fn links(&self) -> Vec<(u32, u32)> {
        self.lock()
            .processes
            .values()
            .filter_map(|r| r.ppid.map(|pp| (r.pid, pp)))
            .collect()
    }
}

#[async_trait]
impl ProcessControl for FakeBackend {
    fn family(&self) -> OsFamily {
        self.family
    }

    async fn kill_by_pid(&self, pid: u32, options: &KillOptions) -> Result<KillResult> {
        self.enter(OperationKind::KillByPid).await?;
        let started = Instant::now();
        let Some(record) = self.remove(pid) else {
            return Ok(KillResult::already_gone(pid, started.elapsed()));
        };
        let mut children_killed = 0;
        if options.include_children {
            for member in tree::descendants(pid, &self.links()) {
                if self.remove(member.pid).is_some() {
                    children_killed += 1;
                }
            }
        }
        Ok(KillResult {
            success: true,
            pid,
            method: KillMethod::for_options(options),
            duration: started.elapsed(),
            process_info: Some(record),
            children_killed,
            error: None,
            session_id: None,
        })
    }

    async fn kill_by_name(&self, pattern: &str, options: &KillOptions) -> Result<KillByNameResult> {
        self.enter(OperationKind::KillByName).await?;
        let matcher = compile_matcher(pattern, options.match_mode)?;
        let pids: Vec<u32> = self
            .lock()
            .processes
            .values()
            .filter(|r| matcher.matches(r, options.match_command, self.family))
            .map(|r| r.pid)
            .collect();
        if let Some(limit) = options.max_matches {
            if pids.len() > limit {
                return Err(Error::TooManyMatches {
                    pattern: pattern.to_string(),
                    found: pids.len(),
                    limit,
                });
            }
        }
        let method = KillMethod::for_options(options);
        let results = pids
            .iter()
            .map(|pid| {
                let record = self.remove(*pid);
                KillResult {
                    success: true,
                    pid: *pid,
                    method,
                    duration: Duration::ZERO,
                    process_info: record,
                    children_killed: 0,
                    error: None,
                    session_id: None,
                }
            })
            .collect();
        Ok(KillByNameResult::from_results(pids.len(), results))
    }

    async fn kill_process_tree(&self, root: u32, _options: &KillOptions) -> Result<TreeKillResult> {
        self.enter(OperationKind::KillProcessTree).await?;
        let members = tree::descendants(root, &self.links());
        let mut order = tree::kill_order(&members);
        order.push(root);
        let killed_count = order.iter().filter(|pid| self.remove(**pid).is_some()).count();
        Ok(TreeKillResult {
            success: true,
            killed_count,
            total_processes: order.len(),
            method: KillMethod::Tree,
        })
    }

    async fn list_processes(&self, options: &ListOptions) -> Result<ProcessSnapshot> {
        self.enter(OperationKind::ListProcesses).await?;
        let records: Vec<ProcessRecord> = self.lock().processes.values().cloned().collect();
        Ok(ProcessSnapshot {
            records: shape_listing(records, options),
            skipped: 0,
            observed_at: Utc::now(),
        })
    }

    async fn get_process_info(&self, pid: u32) -> Result<Option<ProcessRecord>> {
        self.enter(OperationKind::GetProcessInfo).await?;
        Ok(self.lock().processes.get(&pid).cloned())
    }

    async fn process_exists(&self, pid: u32) -> Result<bool> {
        self.enter(OperationKind::ProcessExists).await?;
        Ok(self.is_alive(pid))
    }

    async fn kill_service(&self, name: &str, options: &KillOptions) -> Result<ServiceResult> {
        self.enter(OperationKind::KillService).await?;
        Ok(ServiceResult {
            success: true,
            service: name.to_string(),
            previous_state: "active".to_string(),
            final_state: "inactive".to_string(),
            method: KillMethod::for_options(options),
            duration: Duration::ZERO,
            error: None,
        })
    }

    async fn send_signal(&self, pid: u32, signal: &str) -> Result<SignalResult> {
        let signal = Signal::parse(signal)?;
        self.enter(OperationKind::SendSignal).await?;
        let alive = self.is_alive(pid);
        if alive && signal.is_terminating() {
            self.remove(pid);
        }
        Ok(SignalResult {
            success: alive,
            pid,
            signal,
            error: (!alive).then(|| "no such process".to_string()),
        })
    }

    fn runtime_capabilities(&self) -> BTreeMap<String, bool> {
        self.lock().runtime.clone()
    }

    fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    async fn self_test(&self) -> Result<()> {
        self.lock().self_tests += 1;
        Ok(())
    }

    async fn kill_many(&self, pids: &[u32], options: &KillOptions) -> Vec<Result<KillResult>> {
        self.lock().batches.push(pids.to_vec());
        futures::future::join_all(pids.iter().map(|pid| self.kill_by_pid(*pid, options))).await
    }
}

// ============================================================================
// Process Harness (no-mock integration tests)
// ============================================================================

/// Lightweight process harness for spawning real processes in tests.
#[derive(Debug, Default)]
pub struct ProcessHarness;

impl ProcessHarness {
    /// Return true if the current platform supports spawning test processes.
    pub fn is_available() -> bool {
        #[cfg(unix)]
        {
            std::process::Command::new("sh")
                .arg("-c")
                .arg("true")
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Spawn a sleep process for the given duration (seconds).
    pub fn spawn_sleep(&self, seconds: u64) -> std::io::Result<ProcessHandle> {
        ProcessHandle::spawn("sleep", &[&seconds.max(1).to_string()], false)
    }

    /// Spawn a shell that traps SIGTERM and keeps running until SIGKILL.
    pub fn spawn_term_resistant(&self) -> std::io::Result<ProcessHandle> {
        ProcessHandle::spawn("sh", &["-c", "trap '' TERM; while :; do sleep 1; done"], false)
    }

    /// Spawn a parent with two sleeping children, in its own process group.
    pub fn spawn_tree(&self) -> std::io::Result<ProcessHandle> {
        ProcessHandle::spawn(
            "sh",
            &["-c", "sleep 120 & sleep 120 & wait"],
            true,
        )
    }
}

/// Handle to a spawned process for test control.
pub struct ProcessHandle {
    pid: u32,
    child: Mutex<std::process::Child>,
}

impl ProcessHandle {
    #[cfg(unix)]
    fn spawn(program: &str, args: &[&str], new_pgrp: bool) -> std::io::Result<Self> {
        use std::os::unix::process::CommandExt;

        let mut cmd = std::process::Command::new(program);
        cmd.args(args);
        if new_pgrp {
            cmd.process_group(0);
        }
        let child = cmd.spawn()?;
        Ok(Self {
            pid: child.id(),
            child: Mutex::new(child),
        })
    }

    #[cfg(not(unix))]
    fn spawn(program: &str, args: &[&str], _new_pgrp: bool) -> std::io::Result<Self> {
        let child = std::process::Command::new(program).args(args).spawn()?;
        Ok(Self {
            pid: child.id(),
            child: Mutex::new(child),
        })
    }

    /// Return the PID for this process.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Pids whose parent is this process, read from `ps`.
    #[cfg(unix)]
    pub fn children(&self) -> Vec<u32> {
        let Ok(output) = std::process::Command::new("ps")
            .args(["-A", "-o", "pid=", "-o", "ppid="])
            .output()
        else {
            return Vec::new();
        };
        crate::collect::ps::parse_linkage(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .filter(|(_, ppid)| *ppid == self.pid)
            .map(|(pid, _)| pid)
            .collect()
    }

    /// Check if the process is still running (and not yet reaped).
    pub fn is_running(&self) -> bool {
        let Ok(mut child) = self.child.lock() else {
            return false;
        };
        matches!(child.try_wait(), Ok(None))
    }

    /// Wait for the process to exit, returning true if it exited before timeout.
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.is_running() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Poll until the child has spawned `count` children of its own.
    #[cfg(unix)]
    pub fn wait_for_children(&self, count: usize, timeout: Duration) -> Vec<u32> {
        let start = Instant::now();
        loop {
            let children = self.children();
            if children.len() >= count || start.elapsed() >= timeout {
                return children;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
