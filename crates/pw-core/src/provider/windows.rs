//! Windows backend.
//!
//! Everything goes through native tools: `tasklist` for listings and
//! existence checks, `wmic` for parent linkage and command lines, `taskkill`
//! for termination and `sc` for services. The module builds on every host so
//! its command plumbing is tested everywhere against scripted output.

use super::tree::{self, TreeMember};
use super::{
    compile_matcher, self_pids, shape_listing, validate_pid, validate_service_name,
    wait_until_gone, KillByNameResult, KillMethod, KillOptions, KillResult, ListOptions,
    ProcessControl, ProcessSnapshot, ServiceResult, SignalResult, TreeKillResult,
};
use crate::collect::ps;
use crate::collect::windows::{self as parse, ServiceState};
use crate::collect::{CommandRunner, ProcessRecord, ToolOutput, ToolSpec};
use crate::detect::{benchmark, caps, PlatformInfo};
use async_trait::async_trait;
use pw_common::{Error, OsFamily, Result};
use pw_config::KillSettings;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// `taskkill` exit status for a pid that does not exist.
const TASKKILL_NOT_FOUND: i32 = 128;

/// `sc` error for a service that is not installed.
const SC_SERVICE_DOES_NOT_EXIST: &str = "1060";

/// What one `taskkill` invocation achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskkillOutcome {
    Sent,
    NotFound,
    Denied,
    /// Graceful termination refused (console-less process) or another failure.
    Failed(String),
}

fn classify_taskkill(output: &ToolOutput) -> TaskkillOutcome {
    if output.success() {
        return TaskkillOutcome::Sent;
    }
    let stderr = output.stderr_str();
    let lower = stderr.to_ascii_lowercase();
    if output.exit_code == Some(TASKKILL_NOT_FOUND) || lower.contains("not found") {
        TaskkillOutcome::NotFound
    } else if lower.contains("access is denied") {
        TaskkillOutcome::Denied
    } else {
        TaskkillOutcome::Failed(stderr.trim().to_string())
    }
}

#[derive(Debug)]
pub struct WindowsProvider {
    runner: Arc<dyn CommandRunner>,
    platform: Arc<PlatformInfo>,
    settings: KillSettings,
}

impl WindowsProvider {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        platform: Arc<PlatformInfo>,
        settings: KillSettings,
    ) -> Self {
        Self {
            runner,
            platform,
            settings,
        }
    }

    pub fn settings(&self) -> &KillSettings {
        &self.settings
    }

    async fn run(
        &self,
        command: &str,
        args: Vec<String>,
        operation: &str,
        target: impl std::fmt::Display,
    ) -> Result<ToolOutput> {
        self.runner
            .run(&ToolSpec::new(command, args))
            .await
            .map_err(|e| Error::execution(operation, target, e.to_string()))
    }

    async fn alive(&self, pid: u32) -> Result<bool> {
        let args = strings(&["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"]);
        let output = self.run("tasklist", args, "process_exists", pid).await?;
        if !output.success() {
            return Err(Error::execution(
                "process_exists",
                pid,
                format!("tasklist failed: {}", output.stderr_str().trim()),
            ));
        }
        Ok(parse::tasklist_pids(&output.stdout_str()).contains(&pid))
    }

    /// Poll until gone. A failed check counts as still alive.
    async fn wait_gone(&self, pid: u32, limit: Duration) -> bool {
        wait_until_gone(limit, self.settings.poll_interval(), || async move {
            self.alive(pid).await.unwrap_or(true)
        })
        .await
    }

    async fn taskkill(&self, pid: u32, force: bool, tree: bool) -> Result<TaskkillOutcome> {
        let mut args = Vec::new();
        if tree {
            args.push("/T".to_string());
        }
        if force {
            args.push("/F".to_string());
        }
        args.extend(["/PID".to_string(), pid.to_string()]);
        let output = self.run("taskkill", args, "kill_by_pid", pid).await?;
        let outcome = classify_taskkill(&output);
        if outcome == TaskkillOutcome::Denied {
            return Err(Error::PermissionDenied { pid });
        }
        Ok(outcome)
    }

    /// Graceful then forced per the options. Returns verified-gone and method.
    async fn terminate(
        &self,
        pid: u32,
        options: &KillOptions,
        tree: bool,
    ) -> Result<(bool, KillMethod)> {
        let verify = self.settings.verify_timeout();

        if options.force {
            if self.taskkill(pid, true, tree).await? == TaskkillOutcome::NotFound {
                return Ok((true, KillMethod::Force));
            }
            return Ok((self.wait_gone(pid, verify).await, KillMethod::Force));
        }

        if options.escalate {
            match self.taskkill(pid, false, tree).await? {
                TaskkillOutcome::NotFound => return Ok((true, KillMethod::Escalate)),
                TaskkillOutcome::Sent => {
                    if self.wait_gone(pid, self.settings.escalation_delay()).await {
                        return Ok((true, KillMethod::Escalate));
                    }
                }
                other => debug!(pid, outcome = ?other, "graceful taskkill refused, forcing"),
            }
            if self.taskkill(pid, true, tree).await? == TaskkillOutcome::NotFound {
                return Ok((true, KillMethod::Escalate));
            }
            return Ok((self.wait_gone(pid, verify).await, KillMethod::Escalate));
        }

        match self.taskkill(pid, false, tree).await? {
            TaskkillOutcome::NotFound => Ok((true, KillMethod::Direct)),
            TaskkillOutcome::Failed(reason) => {
                debug!(pid, %reason, "graceful taskkill refused");
                Ok((!self.alive(pid).await.unwrap_or(true), KillMethod::Direct))
            }
            _ => {
                let wait = options.timeout.unwrap_or(self.settings.default_timeout());
                Ok((self.wait_gone(pid, wait).await, KillMethod::Direct))
            }
        }
    }

    async fn wmic_listing(&self, operation: &str) -> Result<Vec<ProcessRecord>> {
        let output = self
            .run("wmic", parse::wmic_process_args(), operation, "all")
            .await?
            .require_success()
            .map_err(|e| Error::execution(operation, "all", e.to_string()))?;
        Ok(parse::parse_wmic_csv(&output.stdout_str(), chrono::Utc::now()).records)
    }

    async fn tasklist_listing(&self, verbose: bool) -> Result<(Vec<ProcessRecord>, usize)> {
        let mut args = Vec::new();
        if verbose {
            args.push("/V".to_string());
        }
        args.extend(strings(&["/FO", "CSV", "/NH"]));
        let output = self
            .run("tasklist", args, "list_processes", "all")
            .await?
            .require_success()
            .map_err(|e| Error::execution("list_processes", "all", e.to_string()))?;
        let listing = parse::parse_tasklist_csv(&output.stdout_str(), chrono::Utc::now());
        Ok((listing.records, listing.skipped))
    }

    /// `(pid, ppid)` pairs from wmic, else PowerShell. `None` when no source
    /// answered.
    async fn linkage(&self, operation: &str) -> Option<Vec<(u32, u32)>> {
        if self.platform.has_tool("wmic") {
            match self.wmic_listing(operation).await {
                Ok(records) => {
                    return Some(
                        records
                            .iter()
                            .filter_map(|r| r.ppid.map(|ppid| (r.pid, ppid)))
                            .collect(),
                    )
                }
                Err(e) => debug!(error = %e, "wmic linkage failed"),
            }
        }
        if self.platform.has_tool("powershell") {
            let output = self
                .run("powershell", parse::powershell_linkage_args(), operation, "all")
                .await
                .and_then(|o| {
                    o.require_success()
                        .map_err(|e| Error::execution(operation, "all", e.to_string()))
                });
            match output {
                Ok(output) => return Some(ps::parse_linkage(&output.stdout_str())),
                Err(e) => debug!(error = %e, "powershell linkage failed"),
            }
        }
        None
    }

    /// Descendants of `root`. `None` when the linkage is unavailable or does
    /// not know the root, so the caller can let `taskkill /T` walk the tree.
    async fn descendants_of(&self, root: u32, operation: &str) -> Option<Vec<TreeMember>> {
        let links = self.linkage(operation).await?;
        if !links.iter().any(|(pid, _)| *pid == root) {
            debug!(root, "root missing from parent linkage");
            return None;
        }
        Some(tree::descendants(root, &links))
    }

    fn prefers_wmic_listing(&self) -> bool {
        self.platform.has_tool("wmic")
            && (self.platform.preferred_tool(benchmark::PROCESS_LISTING) == Some("wmic")
                || !self.platform.has_tool("tasklist"))
    }

    async fn service_query(&self, name: &str) -> Result<Option<(ServiceState, Option<u32>)>> {
        let output = self
            .run("sc", strings(&["queryex", name]), "kill_service", name)
            .await?;
        let text = output.stdout_str();
        if !output.success() {
            if text.contains(SC_SERVICE_DOES_NOT_EXIST) {
                return Ok(None);
            }
            return Err(Error::execution(
                "kill_service",
                name,
                format!("sc queryex failed: {}", text.trim()),
            ));
        }
        Ok(Some((parse::parse_sc_state(&text), parse::parse_sc_pid(&text))))
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl ProcessControl for WindowsProvider {
    fn family(&self) -> OsFamily {
        OsFamily::Windows
    }

    #[instrument(skip(self, options), fields(force = options.force, escalate = options.escalate))]
    async fn kill_by_pid(&self, pid: u32, options: &KillOptions) -> Result<KillResult> {
        let started = Instant::now();
        validate_pid(u64::from(pid), OsFamily::Windows)?;

        if !self.alive(pid).await? {
            debug!(pid, "process not found, nothing to kill");
            return Ok(KillResult::already_gone(pid, started.elapsed()));
        }

        let process_info = match self.get_process_info(pid).await {
            Ok(info) => info,
            Err(e) => {
                debug!(pid, error = %e, "pre-kill lookup failed");
                None
            }
        };

        let mut children_killed = 0;
        let mut use_tree_flag = false;
        if options.include_children {
            let members = match self.descendants_of(pid, "kill_by_pid").await {
                Some(members) => members,
                None => {
                    // No linkage source; let taskkill walk the tree
                    use_tree_flag = true;
                    Vec::new()
                }
            };
            let member_options = options.for_member();
            for child in tree::kill_order(&members) {
                match self.terminate(child, &member_options, false).await {
                    Ok((true, _)) => children_killed += 1,
                    Ok((false, _)) => warn!(pid = child, "child survived kill"),
                    Err(e) => warn!(pid = child, error = %e, "child kill failed"),
                }
            }
        }

        let (gone, method) = self.terminate(pid, options, use_tree_flag).await?;
        if gone {
            info!(pid, %method, children_killed, "process killed");
        } else {
            warn!(pid, %method, "process still running after kill");
        }

        Ok(KillResult {
            success: gone,
            pid,
            method,
            duration: started.elapsed(),
            process_info,
            children_killed,
            error: (!gone).then(|| format!("process {pid} still running after {method} kill")),
            session_id: None,
        })
    }

    #[instrument(skip(self, options))]
    async fn kill_by_name(&self, pattern: &str, options: &KillOptions) -> Result<KillByNameResult> {
        let matcher = compile_matcher(pattern, options.match_mode)?;
        let records = if options.match_command && self.platform.has_tool("wmic") {
            self.wmic_listing("kill_by_name").await?
        } else {
            self.tasklist_listing(false).await?.0
        };

        let own = if options.exclude_self {
            self_pids()
        } else {
            Vec::new()
        };
        let mut pids: Vec<u32> = records
            .iter()
            .filter(|r| matcher.matches(r, options.match_command, OsFamily::Windows))
            .map(|r| r.pid)
            .filter(|p| !own.contains(p))
            .collect();
        pids.sort_unstable();
        pids.dedup();

        let total_found = pids.len();
        if let Some(limit) = options.max_matches {
            if total_found > limit {
                return Err(Error::TooManyMatches {
                    pattern: pattern.to_string(),
                    found: total_found,
                    limit,
                });
            }
        }

        let batch_size = options.batch_size.unwrap_or(self.settings.batch_size);
        let results =
            super::kill_in_batches(self, &pids, options, batch_size, self.settings.batch_pause())
                .await;
        Ok(KillByNameResult::from_results(total_found, results))
    }

    #[instrument(skip(self, options))]
    async fn kill_process_tree(&self, root: u32, options: &KillOptions) -> Result<TreeKillResult> {
        validate_pid(u64::from(root), OsFamily::Windows)?;
        if !self.alive(root).await? {
            return Ok(TreeKillResult {
                success: true,
                killed_count: 0,
                total_processes: 0,
                method: KillMethod::Validation,
            });
        }

        let Some(members) = self.descendants_of(root, "kill_process_tree").await else {
            // Children are unknown; taskkill /T walks the tree itself
            let (gone, _) = self.terminate(root, options, true).await?;
            info!(root, gone, "process tree kill through taskkill /T finished");
            return Ok(TreeKillResult {
                success: gone,
                killed_count: usize::from(gone),
                total_processes: 1,
                method: KillMethod::Group,
            });
        };
        let mut ordered = tree::kill_order(&members);
        ordered.push(root);
        let total_processes = ordered.len();

        let mut method = KillMethod::Tree;
        if self.platform.supports(caps::PROCESS_GROUP_KILL) {
            match self.taskkill(root, options.force, true).await {
                Ok(TaskkillOutcome::Sent) => {
                    method = KillMethod::Group;
                    self.wait_gone(root, self.settings.escalation_delay()).await;
                }
                Ok(other) => debug!(root, outcome = ?other, "tree taskkill did not complete"),
                Err(e) => warn!(root, error = %e, "tree taskkill failed"),
            }
        }

        let member_options = options.for_member();
        for pid in ordered.iter().copied() {
            if !self.alive(pid).await.unwrap_or(true) {
                continue;
            }
            if let Err(e) = self.terminate(pid, &member_options, false).await {
                warn!(pid, error = %e, "tree member kill failed");
            }
        }

        let mut remaining = 0;
        for pid in &ordered {
            if self.alive(*pid).await.unwrap_or(true) {
                remaining += 1;
            }
        }
        info!(root, total_processes, remaining, %method, "process tree kill finished");
        Ok(TreeKillResult {
            success: remaining == 0,
            killed_count: total_processes - remaining,
            total_processes,
            method,
        })
    }

    async fn list_processes(&self, options: &ListOptions) -> Result<ProcessSnapshot> {
        let (records, skipped) = if self.prefers_wmic_listing() {
            (self.wmic_listing("list_processes").await?, 0)
        } else {
            self.tasklist_listing(true).await?
        };
        Ok(ProcessSnapshot {
            records: shape_listing(records, options),
            skipped,
            observed_at: chrono::Utc::now(),
        })
    }

    async fn get_process_info(&self, pid: u32) -> Result<Option<ProcessRecord>> {
        validate_pid(u64::from(pid), OsFamily::Windows)?;
        let args = strings(&["/V", "/FO", "CSV", "/NH", "/FI", &format!("PID eq {pid}")]);
        let output = self.run("tasklist", args, "get_process_info", pid).await?;
        if !output.success() {
            return Err(Error::execution(
                "get_process_info",
                pid,
                format!("tasklist failed: {}", output.stderr_str().trim()),
            ));
        }
        let Some(mut record) = parse::parse_tasklist_csv(&output.stdout_str(), chrono::Utc::now())
            .records
            .into_iter()
            .find(|r| r.pid == pid)
        else {
            return Ok(None);
        };

        // tasklist knows neither the parent nor the command line
        if self.platform.has_tool("wmic") {
            let args = strings(&[
                "process",
                "where",
                &format!("ProcessId={pid}"),
                "get",
                "CommandLine,Name,ParentProcessId,ProcessId,WorkingSetSize",
                "/format:csv",
            ]);
            if let Ok(output) = self.run("wmic", args, "get_process_info", pid).await {
                let listing = parse::parse_wmic_csv(&output.stdout_str(), record.observed_at);
                if let Some(detail) = listing.records.into_iter().find(|r| r.pid == pid) {
                    record.ppid = detail.ppid;
                    record.command = detail.command;
                }
            }
        }
        Ok(Some(record))
    }

    async fn process_exists(&self, pid: u32) -> Result<bool> {
        validate_pid(u64::from(pid), OsFamily::Windows)?;
        self.alive(pid).await
    }

    #[instrument(skip(self, options))]
    async fn kill_service(&self, name: &str, options: &KillOptions) -> Result<ServiceResult> {
        if !self.platform.supports(caps::KILL_SERVICE) {
            return Err(Error::unsupported("kill_service", self.platform.platform.clone()));
        }
        validate_service_name(name)?;
        let started = Instant::now();

        let Some((previous, service_pid)) = self.service_query(name).await? else {
            return Ok(ServiceResult {
                success: true,
                service: name.to_string(),
                previous_state: "not_installed".to_string(),
                final_state: "not_installed".to_string(),
                method: KillMethod::Validation,
                duration: started.elapsed(),
                error: None,
            });
        };
        if previous.is_inactive() {
            return Ok(ServiceResult {
                success: true,
                service: name.to_string(),
                previous_state: previous.as_str().to_string(),
                final_state: previous.as_str().to_string(),
                method: KillMethod::Validation,
                duration: started.elapsed(),
                error: None,
            });
        }

        let mut error = None;
        let method = match (options.force, service_pid) {
            (true, Some(pid)) => {
                if let TaskkillOutcome::Failed(reason) = self.taskkill(pid, true, true).await? {
                    error = Some(reason);
                }
                KillMethod::Force
            }
            _ => {
                let output = self
                    .run("sc", strings(&["stop", name]), "kill_service", name)
                    .await?;
                if !output.success() {
                    error = Some(format!("sc stop failed: {}", output.stdout_str().trim()));
                }
                if options.force {
                    KillMethod::Force
                } else {
                    KillMethod::Direct
                }
            }
        };

        let limit = options.timeout.unwrap_or(self.settings.verify_timeout());
        let deadline = Instant::now() + limit;
        let mut state = self.service_query(name).await?.map(|(s, _)| s);
        while state.is_some_and(|s| !s.is_inactive()) && Instant::now() < deadline {
            tokio::time::sleep(self.settings.poll_interval()).await;
            state = self.service_query(name).await?.map(|(s, _)| s);
        }

        let success = state.map_or(true, |s| s.is_inactive());
        Ok(ServiceResult {
            success,
            service: name.to_string(),
            previous_state: previous.as_str().to_string(),
            final_state: state.map_or("not_installed", |s| s.as_str()).to_string(),
            method,
            duration: started.elapsed(),
            error: if success {
                None
            } else {
                error.or_else(|| Some("service still running".into()))
            },
        })
    }

    async fn send_signal(&self, _pid: u32, _signal: &str) -> Result<SignalResult> {
        Err(Error::unsupported("send_signal", "windows"))
    }

    fn runtime_capabilities(&self) -> BTreeMap<String, bool> {
        let mut flags = BTreeMap::new();
        flags.insert(caps::SEND_SIGNAL.to_string(), false);
        flags
    }

    fn platform(&self) -> &PlatformInfo {
        &self.platform
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{platform_info, ScriptedResponse, ScriptedRunner};

    const ALL_TOOLS: &[&str] = &["taskkill", "tasklist", "wmic", "powershell", "sc", "netstat"];

    fn settings() -> KillSettings {
        KillSettings {
            escalation_delay_ms: 10,
            poll_interval_ms: 2,
            verify_timeout_ms: 30,
            default_timeout_ms: 30,
            batch_pause_ms: 1,
            ..KillSettings::windows_defaults()
        }
    }

    fn provider(runner: Arc<ScriptedRunner>, tools: &[&str]) -> WindowsProvider {
        WindowsProvider::new(
            runner,
            Arc::new(platform_info(OsFamily::Windows, tools, true)),
            settings(),
        )
    }

    fn task_row(name: &str, pid: u32) -> String {
        format!("\"{name}\",\"{pid}\",\"Console\",\"1\",\"10,000 K\"\r\n")
    }

    const NO_TASKS: &str = "INFO: No tasks are running which match the specified criteria.\r\n";

    /// 500 -> 510 -> 520
    const WMIC_TREE: &str = "\r\r\nNode,CommandLine,Name,ParentProcessId,ProcessId,WorkingSetSize\r\r\n\
HOST,parent.exe,parent.exe,4,500,4096\r\r\n\
HOST,child.exe,child.exe,500,510,4096\r\r\n\
HOST,leaf.exe,leaf.exe,510,520,4096\r\r\n";

    fn provider_without_group(runner: Arc<ScriptedRunner>, tools: &[&str]) -> WindowsProvider {
        WindowsProvider::new(
            runner,
            Arc::new(platform_info(OsFamily::Windows, tools, false)),
            settings(),
        )
    }

    /// Scripted `tasklist` existence answers, one sequence per pid.
    fn lifecycle(mut runner: ScriptedRunner, pids: &[(u32, usize)]) -> ScriptedRunner {
        for &(pid, alive_checks) in pids {
            let filter = format!("PID eq {pid}");
            let mut responses: Vec<ScriptedResponse> = (0..alive_checks)
                .map(|_| ScriptedResponse::ok(task_row("app.exe", pid)))
                .collect();
            responses.push(ScriptedResponse::ok(NO_TASKS));
            runner = runner.on_sequence("tasklist", &["/FI", filter.as_str()], responses);
        }
        runner
    }

    fn taskkill_args(runner: &ScriptedRunner) -> Vec<Vec<String>> {
        runner
            .calls()
            .into_iter()
            .filter(|c| c.command == "taskkill")
            .map(|c| c.args)
            .collect()
    }

    #[tokio::test]
    async fn test_missing_pid_is_validation_success() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "tasklist",
            &["/FI"],
            ScriptedResponse::ok(NO_TASKS),
        ));
        let p = provider(runner.clone(), ALL_TOOLS);
        let result = p.kill_by_pid(4321, &KillOptions::forced()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.method, KillMethod::Validation);
        assert_eq!(runner.calls_to("taskkill"), 0);
    }

    #[tokio::test]
    async fn test_force_kill_verifies_gone() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on_sequence(
                    "tasklist",
                    &["/FI", "PID eq 4321"],
                    vec![
                        ScriptedResponse::ok(task_row("app.exe", 4321)),
                        ScriptedResponse::ok(NO_TASKS),
                    ],
                )
                .on("taskkill", &["/F", "/PID", "4321"], ScriptedResponse::ok("SUCCESS")),
        );
        let p = provider(runner.clone(), &["taskkill", "tasklist"]);
        let result = p.kill_by_pid(4321, &KillOptions::forced()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.method, KillMethod::Force);
        assert_eq!(runner.calls_to("taskkill"), 1);
    }

    #[tokio::test]
    async fn test_escalate_forces_after_graceful_refusal() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on_sequence(
                    "tasklist",
                    &["/FI"],
                    vec![
                        ScriptedResponse::ok(task_row("svc.exe", 77)),
                        ScriptedResponse::ok(NO_TASKS),
                    ],
                )
                .on(
                    "taskkill",
                    &["/PID", "77"],
                    ScriptedResponse::exit(
                        1,
                        "ERROR: The process with PID 77 could not be terminated. This process can only be terminated forcefully (with /F option).",
                    ),
                )
                .on("taskkill", &["/F", "/PID", "77"], ScriptedResponse::ok("SUCCESS")),
        );
        let p = provider(runner.clone(), &["taskkill", "tasklist"]);
        let result = p.kill_by_pid(77, &KillOptions::escalating()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.method, KillMethod::Escalate);
        assert_eq!(runner.calls_to("taskkill"), 2);
    }

    #[tokio::test]
    async fn test_access_denied_is_permission_error() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("tasklist", &["/FI"], ScriptedResponse::ok(task_row("lsass.exe", 600)))
                .on(
                    "taskkill",
                    &[],
                    ScriptedResponse::exit(
                        1,
                        "ERROR: The process with PID 600 could not be terminated.\r\n\
                         Reason: Access is denied.",
                    ),
                ),
        );
        let p = provider(runner, &["taskkill", "tasklist"]);
        let err = p.kill_by_pid(600, &KillOptions::forced()).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { pid: 600 }));
    }

    #[tokio::test]
    async fn test_kill_by_name_matches_image_without_extension() {
        let listing = format!(
            "{}{}{}",
            task_row("notepad.exe", 10),
            task_row("Notepad.exe", 11),
            task_row("explorer.exe", 12)
        );
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("tasklist", &["/FO"], ScriptedResponse::ok(listing))
                .on("tasklist", &["/FI"], ScriptedResponse::ok(NO_TASKS)),
        );
        let p = provider(runner, &["taskkill", "tasklist"]);
        let options = KillOptions {
            max_matches: Some(1),
            ..KillOptions::default()
        };
        let err = p.kill_by_name("notepad", &options).await.unwrap_err();
        assert!(matches!(err, Error::TooManyMatches { found: 2, .. }));

        let result = p.kill_by_name("notepad", &KillOptions::default()).await.unwrap();
        assert_eq!(result.total_found, 2);
        // Both vanished before the kill reached them
        assert!(result.results.iter().all(|r| r.method == KillMethod::Validation));
    }

    #[tokio::test]
    async fn test_kill_with_children_walks_wmic_linkage() {
        let runner = Arc::new(
            lifecycle(ScriptedRunner::new(), &[(500, 1), (510, 0), (520, 0)])
                .on("wmic", &["process", "get"], ScriptedResponse::ok(WMIC_TREE))
                .on("taskkill", &["/PID"], ScriptedResponse::ok("SUCCESS")),
        );
        let p = provider(runner.clone(), ALL_TOOLS);
        let options = KillOptions {
            include_children: true,
            ..KillOptions::default()
        };
        let result = p.kill_by_pid(500, &options).await.unwrap();
        assert!(result.success);
        assert_eq!(result.children_killed, 2);
        assert_eq!(
            taskkill_args(&runner),
            vec![
                strings(&["/PID", "520"]),
                strings(&["/PID", "510"]),
                strings(&["/PID", "500"]),
            ]
        );
    }

    #[tokio::test]
    async fn test_tree_kill_without_wmic_reads_linkage_from_powershell() {
        let runner = Arc::new(
            lifecycle(ScriptedRunner::new(), &[(500, 2), (510, 1), (520, 1)])
                .on(
                    "powershell",
                    &["-NoProfile"],
                    ScriptedResponse::ok("4 0\r\n500 4\r\n510 500\r\n520 510\r\n"),
                )
                .on("taskkill", &["/PID"], ScriptedResponse::ok("SUCCESS")),
        );
        let p = provider_without_group(runner.clone(), &["taskkill", "tasklist", "powershell"]);
        let result = p.kill_process_tree(500, &KillOptions::default()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.method, KillMethod::Tree);
        assert_eq!(result.total_processes, 3);
        assert_eq!(result.killed_count, 3);
        assert_eq!(runner.calls_to("powershell"), 1);
        assert_eq!(
            taskkill_args(&runner),
            vec![
                strings(&["/PID", "520"]),
                strings(&["/PID", "510"]),
                strings(&["/PID", "500"]),
            ]
        );
    }

    #[tokio::test]
    async fn test_tree_kill_without_linkage_lets_taskkill_walk_tree() {
        let runner = Arc::new(
            lifecycle(ScriptedRunner::new(), &[(500, 1)])
                .on("taskkill", &["/T"], ScriptedResponse::ok("SUCCESS")),
        );
        let p = provider_without_group(runner.clone(), &["taskkill", "tasklist"]);
        let result = p.kill_process_tree(500, &KillOptions::default()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.method, KillMethod::Group);
        assert_eq!(taskkill_args(&runner), vec![strings(&["/T", "/PID", "500"])]);
    }

    #[tokio::test]
    async fn test_tree_kill_with_group_support_sends_one_tree_taskkill() {
        let runner = Arc::new(
            lifecycle(ScriptedRunner::new(), &[(500, 1), (510, 0), (520, 0)])
                .on("wmic", &["process", "get"], ScriptedResponse::ok(WMIC_TREE))
                .on("taskkill", &["/T"], ScriptedResponse::ok("SUCCESS")),
        );
        let p = provider(runner.clone(), ALL_TOOLS);
        let result = p.kill_process_tree(500, &KillOptions::default()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.method, KillMethod::Group);
        assert_eq!(result.total_processes, 3);
        assert_eq!(result.killed_count, 3);
        assert_eq!(taskkill_args(&runner), vec![strings(&["/T", "/PID", "500"])]);
    }

    #[tokio::test]
    async fn test_send_signal_unsupported() {
        let p = provider(Arc::new(ScriptedRunner::new()), ALL_TOOLS);
        let err = p.send_signal(10, "TERM").await.unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
        assert!(!p.runtime_capabilities()[caps::SEND_SIGNAL]);
    }

    #[tokio::test]
    async fn test_list_prefers_tasklist_and_shapes() {
        let listing = format!("{}{}", task_row("b.exe", 2), task_row("a.exe", 1));
        let runner = Arc::new(ScriptedRunner::new().on(
            "tasklist",
            &["/V"],
            ScriptedResponse::ok(listing),
        ));
        let p = provider(runner.clone(), ALL_TOOLS);
        let snapshot = p
            .list_processes(&ListOptions {
                limit: Some(1),
                ..ListOptions::default()
            })
            .await
            .unwrap();
        let pids: Vec<u32> = snapshot.into_iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![1]);
        assert_eq!(runner.calls_to("wmic"), 0);
    }

    #[tokio::test]
    async fn test_kill_service_stopped_is_noop() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "sc",
            &["queryex"],
            ScriptedResponse::ok("SERVICE_NAME: Spooler\n        STATE              : 1  STOPPED\n        PID                : 0\n"),
        ));
        let p = provider(runner.clone(), ALL_TOOLS);
        let result = p.kill_service("Spooler", &KillOptions::default()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.method, KillMethod::Validation);
        assert_eq!(result.previous_state, "stopped");
        assert_eq!(runner.calls_to("sc"), 1);
    }

    #[tokio::test]
    async fn test_kill_service_stop_then_verify() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on_sequence(
                    "sc",
                    &["queryex"],
                    vec![
                        ScriptedResponse::ok("        STATE              : 4  RUNNING\n        PID                : 2212\n"),
                        ScriptedResponse::ok("        STATE              : 3  STOP_PENDING\n        PID                : 2212\n"),
                        ScriptedResponse::ok("        STATE              : 1  STOPPED\n        PID                : 0\n"),
                    ],
                )
                .on("sc", &["stop"], ScriptedResponse::ok("")),
        );
        let p = provider(runner, ALL_TOOLS);
        let options = KillOptions {
            timeout: Some(Duration::from_secs(1)),
            ..KillOptions::default()
        };
        let result = p.kill_service("Spooler", &options).await.unwrap();
        assert!(result.success);
        assert_eq!(result.previous_state, "running");
        assert_eq!(result.final_state, "stopped");
    }

    #[test]
    fn test_classify_taskkill() {
        let out = |code: i32, stderr: &str| ToolOutput {
            exit_code: Some(code),
            stderr: stderr.as_bytes().to_vec(),
            ..ToolOutput::default()
        };
        assert_eq!(classify_taskkill(&out(0, "")), TaskkillOutcome::Sent);
        assert_eq!(
            classify_taskkill(&out(128, "ERROR: The process \"99\" not found.")),
            TaskkillOutcome::NotFound
        );
        assert!(matches!(
            classify_taskkill(&out(1, "could not be terminated")),
            TaskkillOutcome::Failed(_)
        ));
    }
}
