//! Unix-family backend.
//!
//! Signals go straight through `kill(2)`; listings and lookups go through
//! `ps`, `pgrep` and `systemctl` via the [`CommandRunner`]. Signal delivery
//! sits behind [`SignalDelivery`] so tests can substitute a fake process
//! table.

use super::tree::{self, TreeMember};
use super::{
    compile_matcher, self_pids, shape_listing, validate_pid, wait_until_gone, KillByNameResult,
    KillMethod, KillOptions, KillResult, ListOptions, NameMatcher, ProcessControl,
    ProcessSnapshot, ServiceResult, SignalResult, TreeKillResult,
};
use crate::collect::{ps, CommandRunner, ProcessRecord, ToolOutput, ToolSpec};
use crate::detect::{caps, PlatformInfo};
use async_trait::async_trait;
use pw_common::{Error, OsFamily, Result, Signal};
use pw_config::KillSettings;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use tracing::{debug, info, instrument, warn};

/// Longest process name `pgrep -x` can match on Linux (`TASK_COMM_LEN - 1`).
const PGREP_NAME_LIMIT: usize = 15;

/// Failure modes of a single `kill(2)` call.
#[derive(Debug, ThisError)]
pub enum SignalError {
    #[error("no such process")]
    NoSuchProcess,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid signal")]
    InvalidSignal,
    #[error("{0}")]
    Os(std::io::Error),
}

/// Signal delivery and liveness primitives.
pub trait SignalDelivery: Send + Sync + std::fmt::Debug {
    fn signal(&self, pid: u32, signal: i32) -> std::result::Result<(), SignalError>;

    fn signal_group(&self, pgid: u32, signal: i32) -> std::result::Result<(), SignalError>;

    /// Whether the pid names a live (non-zombie) process.
    fn is_alive(&self, pid: u32) -> bool;

    fn process_group(&self, pid: u32) -> Option<u32>;

    fn own_process_group(&self) -> Option<u32>;
}

/// Production [`SignalDelivery`] over libc.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcSignaller;

impl LibcSignaller {
    fn raw_kill(target: libc::pid_t, signal: i32) -> std::result::Result<(), SignalError> {
        // SAFETY: kill has no memory-safety preconditions.
        let rc = unsafe { libc::kill(target, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Err(SignalError::NoSuchProcess),
            Some(libc::EPERM) => Err(SignalError::PermissionDenied),
            Some(libc::EINVAL) => Err(SignalError::InvalidSignal),
            _ => Err(SignalError::Os(err)),
        }
    }

    fn to_pid(pid: u32) -> std::result::Result<libc::pid_t, SignalError> {
        match libc::pid_t::try_from(pid) {
            Ok(p) if p > 0 => Ok(p),
            _ => Err(SignalError::NoSuchProcess),
        }
    }
}

impl SignalDelivery for LibcSignaller {
    fn signal(&self, pid: u32, signal: i32) -> std::result::Result<(), SignalError> {
        Self::raw_kill(Self::to_pid(pid)?, signal)
    }

    fn signal_group(&self, pgid: u32, signal: i32) -> std::result::Result<(), SignalError> {
        Self::raw_kill(-Self::to_pid(pgid)?, signal)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let alive = match Self::to_pid(pid).and_then(|p| Self::raw_kill(p, 0)) {
            Ok(()) => true,
            // Exists but owned by someone else
            Err(SignalError::PermissionDenied) => true,
            Err(_) => false,
        };
        alive && !is_zombie(pid)
    }

    fn process_group(&self, pid: u32) -> Option<u32> {
        let pid = Self::to_pid(pid).ok()?;
        // SAFETY: getpgid has no memory-safety preconditions.
        let pgid = unsafe { libc::getpgid(pid) };
        u32::try_from(pgid).ok().filter(|p| *p > 0)
    }

    fn own_process_group(&self) -> Option<u32> {
        // SAFETY: getpgrp cannot fail.
        let pgid = unsafe { libc::getpgrp() };
        u32::try_from(pgid).ok()
    }
}

/// A zombie has exited and only awaits reaping; it counts as gone.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Format: pid (comm) state ...; comm may contain spaces and parens
    stat.rfind(')')
        .and_then(|end| stat.get(end + 2..))
        .and_then(|rest| rest.chars().next())
        .is_some_and(|state| state == 'Z' || state == 'X')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Backend for Linux, macOS and the BSDs.
#[derive(Debug)]
pub struct UnixProvider {
    runner: Arc<dyn CommandRunner>,
    signals: Arc<dyn SignalDelivery>,
    platform: Arc<PlatformInfo>,
    settings: KillSettings,
}

impl UnixProvider {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        platform: Arc<PlatformInfo>,
        settings: KillSettings,
    ) -> Self {
        Self {
            runner,
            signals: Arc::new(LibcSignaller),
            platform,
            settings,
        }
    }

    /// Replace the signal primitives.
    pub fn with_signals(mut self, signals: Arc<dyn SignalDelivery>) -> Self {
        self.signals = signals;
        self
    }

    pub fn settings(&self) -> &KillSettings {
        &self.settings
    }

    async fn run(
        &self,
        spec: ToolSpec,
        operation: &str,
        target: impl std::fmt::Display,
    ) -> Result<ToolOutput> {
        self.runner
            .run(&spec)
            .await
            .map_err(|e| Error::execution(operation, target, e.to_string()))
    }

    /// Send one signal. `Ok(false)` means the process was already gone.
    fn deliver(&self, pid: u32, signal: Signal) -> Result<bool> {
        match self.signals.signal(pid, signal.as_raw()) {
            Ok(()) => Ok(true),
            Err(SignalError::NoSuchProcess) => Ok(false),
            Err(SignalError::PermissionDenied) => Err(Error::PermissionDenied { pid }),
            Err(SignalError::InvalidSignal) => Err(Error::InvalidSignal(signal.to_string())),
            Err(SignalError::Os(e)) => Err(Error::execution("kill", pid, e.to_string())),
        }
    }

    async fn wait_gone(&self, pid: u32, limit: Duration) -> bool {
        wait_until_gone(limit, self.settings.poll_interval(), || {
            let alive = self.signals.is_alive(pid);
            async move { alive }
        })
        .await
    }

    /// Take one pid down according to the options. Returns whether it is
    /// verified gone and the method used.
    async fn terminate(&self, pid: u32, options: &KillOptions) -> Result<(bool, KillMethod)> {
        let verify = self.settings.verify_timeout();

        if options.force {
            if !self.deliver(pid, Signal::Kill)? {
                return Ok((true, KillMethod::Force));
            }
            return Ok((self.wait_gone(pid, verify).await, KillMethod::Force));
        }

        if options.escalate {
            let ladder = [Signal::Term, Signal::Int, Signal::Kill];
            for (step, signal) in ladder.iter().enumerate() {
                if !self.deliver(pid, *signal)? {
                    return Ok((true, KillMethod::Escalate));
                }
                let last = step + 1 == ladder.len();
                let wait = if last {
                    verify
                } else {
                    self.settings.escalation_delay()
                };
                if self.wait_gone(pid, wait).await {
                    debug!(pid, signal = %signal, "process exited");
                    return Ok((true, KillMethod::Escalate));
                }
                if !last {
                    debug!(pid, signal = %signal, "still running, escalating");
                }
            }
            return Ok((false, KillMethod::Escalate));
        }

        let signal = options.signal.unwrap_or(Signal::Term);
        if !self.deliver(pid, signal)? {
            return Ok((true, KillMethod::Direct));
        }
        let wait = if signal.is_forceful() {
            verify
        } else {
            options.timeout.unwrap_or(self.settings.default_timeout())
        };
        Ok((self.wait_gone(pid, wait).await, KillMethod::Direct))
    }

    async fn descendants_of(&self, root: u32) -> Result<Vec<TreeMember>> {
        let output = self
            .run(ToolSpec::new("ps", ps::linkage_args()), "kill_process_tree", root)
            .await?
            .require_success()
            .map_err(|e| Error::execution("kill_process_tree", root, e.to_string()))?;
        let links = ps::parse_linkage(&output.stdout_str());
        Ok(tree::descendants(root, &links))
    }

    async fn scan(&self) -> Result<(Vec<ProcessRecord>, usize)> {
        let output = self
            .run(ToolSpec::new("ps", ps::list_all_args()), "list_processes", "all")
            .await?
            .require_success()
            .map_err(|e| Error::execution("list_processes", "all", e.to_string()))?;
        let listing = ps::parse_ps_output(&output.stdout_str(), chrono::Utc::now());
        if listing.skipped > 0 {
            debug!(skipped = listing.skipped, "ps rows skipped");
        }
        Ok((listing.records, listing.skipped))
    }

    /// Pids matching a name kill, through `pgrep` when it can answer the
    /// question exactly, otherwise through a full listing.
    async fn resolve_matches(
        &self,
        pattern: &str,
        matcher: &NameMatcher,
        options: &KillOptions,
    ) -> Result<Vec<u32>> {
        let pattern = pattern.trim();
        let pgrep_args = match matcher {
            _ if options.match_command || !self.platform.has_tool("pgrep") => None,
            NameMatcher::Exact(_) if pattern.len() <= PGREP_NAME_LIMIT => Some(vec!["-x"]),
            NameMatcher::Exact(_) => None,
            NameMatcher::Regex(_) => Some(vec!["-i"]),
        };

        if let Some(mut args) = pgrep_args {
            args.extend(["--", pattern]);
            let args: Vec<String> = args.into_iter().map(str::to_string).collect();
            let output = self
                .run(ToolSpec::new("pgrep", args), "kill_by_name", pattern)
                .await?;
            return match output.exit_code {
                Some(0) => Ok(output
                    .stdout_str()
                    .lines()
                    .filter_map(|l| l.trim().parse().ok())
                    .collect()),
                // No match
                Some(1) => Ok(Vec::new()),
                _ => Err(Error::execution(
                    "kill_by_name",
                    pattern,
                    format!("pgrep failed: {}", output.stderr_str().trim()),
                )),
            };
        }

        let (records, _) = self.scan().await?;
        Ok(records
            .iter()
            .filter(|r| matcher.matches(r, options.match_command, OsFamily::Unix))
            .map(|r| r.pid)
            .collect())
    }

    async fn service_state(&self, name: &str) -> Result<String> {
        // is-active exits non-zero for inactive units but still prints the state
        let output = self
            .run(
                ToolSpec::new("systemctl", vec!["is-active".into(), name.into()]),
                "kill_service",
                name,
            )
            .await?;
        let state = output.stdout_str().trim().to_string();
        if state.is_empty() {
            return Err(Error::execution(
                "kill_service",
                name,
                format!("systemctl printed no state: {}", output.stderr_str().trim()),
            ));
        }
        Ok(state)
    }
}

fn service_is_active(state: &str) -> bool {
    matches!(state, "active" | "activating" | "deactivating" | "reloading" | "refreshing")
}

#[async_trait]
impl ProcessControl for UnixProvider {
    fn family(&self) -> OsFamily {
        OsFamily::Unix
    }

    #[instrument(skip(self, options), fields(force = options.force, escalate = options.escalate))]
    async fn kill_by_pid(&self, pid: u32, options: &KillOptions) -> Result<KillResult> {
        let started = Instant::now();
        validate_pid(u64::from(pid), OsFamily::Unix)?;

        if !self.signals.is_alive(pid) {
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
        if options.include_children {
            let members = self.descendants_of(pid).await?;
            let member_options = options.for_member();
            for child in tree::kill_order(&members) {
                match self.terminate(child, &member_options).await {
                    Ok((true, _)) => children_killed += 1,
                    Ok((false, _)) => warn!(pid = child, "child survived kill"),
                    Err(e) => warn!(pid = child, error = %e, "child kill failed"),
                }
            }
        }

        let (gone, method) = self.terminate(pid, options).await?;
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
        let mut pids = self.resolve_matches(pattern, &matcher, options).await?;
        if options.exclude_self {
            let own = self_pids();
            pids.retain(|p| !own.contains(p));
        }
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
        validate_pid(u64::from(root), OsFamily::Unix)?;
        if !self.signals.is_alive(root) {
            return Ok(TreeKillResult {
                success: true,
                killed_count: 0,
                total_processes: 0,
                method: KillMethod::Validation,
            });
        }

        let members = self.descendants_of(root).await?;
        let mut ordered = tree::kill_order(&members);
        ordered.push(root);
        let total_processes = ordered.len();
        let mut method = KillMethod::Tree;

        let leads_own_group = self.signals.process_group(root) == Some(root);
        let is_our_group = self.signals.own_process_group() == Some(root);
        if self.platform.supports(caps::PROCESS_GROUP_KILL) && leads_own_group && !is_our_group {
            let signal = if options.force {
                Signal::Kill
            } else {
                options.signal.unwrap_or(Signal::Term)
            };
            match self.signals.signal_group(root, signal.as_raw()) {
                Ok(()) => {
                    method = KillMethod::Group;
                    wait_until_gone(
                        self.settings.escalation_delay(),
                        self.settings.poll_interval(),
                        || {
                            let any = ordered.iter().any(|p| self.signals.is_alive(*p));
                            async move { any }
                        },
                    )
                    .await;
                }
                Err(e) => debug!(root, error = %e, "group signal failed, killing members"),
            }
        }

        let member_options = options.for_member();
        for pid in ordered.iter().copied() {
            if !self.signals.is_alive(pid) {
                continue;
            }
            if let Err(e) = self.terminate(pid, &member_options).await {
                warn!(pid, error = %e, "tree member kill failed");
            }
        }

        let remaining = ordered.iter().filter(|p| self.signals.is_alive(**p)).count();
        info!(root, total_processes, remaining, %method, "process tree kill finished");
        Ok(TreeKillResult {
            success: remaining == 0,
            killed_count: total_processes - remaining,
            total_processes,
            method,
        })
    }

    async fn list_processes(&self, options: &ListOptions) -> Result<ProcessSnapshot> {
        let (records, skipped) = self.scan().await?;
        Ok(ProcessSnapshot {
            records: shape_listing(records, options),
            skipped,
            observed_at: chrono::Utc::now(),
        })
    }

    async fn get_process_info(&self, pid: u32) -> Result<Option<ProcessRecord>> {
        validate_pid(u64::from(pid), OsFamily::Unix)?;
        let output = self
            .run(ToolSpec::new("ps", ps::single_pid_args(pid)), "get_process_info", pid)
            .await?;
        match output.exit_code {
            Some(0) => Ok(ps::parse_ps_output(&output.stdout_str(), chrono::Utc::now())
                .records
                .into_iter()
                .find(|r| r.pid == pid)),
            // ps exits 1 when the pid matches nothing
            Some(1) if output.stdout.iter().all(u8::is_ascii_whitespace) => Ok(None),
            _ => Err(Error::execution(
                "get_process_info",
                pid,
                format!("ps failed: {}", output.stderr_str().trim()),
            )),
        }
    }

    async fn process_exists(&self, pid: u32) -> Result<bool> {
        validate_pid(u64::from(pid), OsFamily::Unix)?;
        Ok(self.signals.is_alive(pid))
    }

    #[instrument(skip(self, options))]
    async fn kill_service(&self, name: &str, options: &KillOptions) -> Result<ServiceResult> {
        if !self.platform.supports(caps::KILL_SERVICE) {
            return Err(Error::unsupported("kill_service", self.platform.platform.clone()));
        }
        super::validate_service_name(name)?;
        let started = Instant::now();

        let previous_state = self.service_state(name).await?;
        if !service_is_active(&previous_state) {
            return Ok(ServiceResult {
                success: true,
                service: name.to_string(),
                final_state: previous_state.clone(),
                previous_state,
                method: KillMethod::Validation,
                duration: started.elapsed(),
                error: None,
            });
        }

        let mut steps: Vec<Vec<String>> = Vec::new();
        let method = if options.force {
            steps.push(vec!["kill".into(), "--signal=SIGKILL".into(), name.into()]);
            KillMethod::Force
        } else {
            KillMethod::Direct
        };
        steps.push(vec!["stop".into(), name.into()]);

        let mut error = None;
        for args in steps {
            let output = self
                .run(ToolSpec::new("systemctl", args.clone()), "kill_service", name)
                .await?;
            if !output.success() {
                let message = format!(
                    "systemctl {} failed: {}",
                    args.join(" "),
                    output.stderr_str().trim()
                );
                warn!(service = name, %message);
                error = Some(message);
            }
        }

        let limit = options.timeout.unwrap_or(self.settings.verify_timeout());
        let deadline = Instant::now() + limit;
        let mut final_state = self.service_state(name).await?;
        while service_is_active(&final_state) && Instant::now() < deadline {
            tokio::time::sleep(self.settings.poll_interval()).await;
            final_state = self.service_state(name).await?;
        }

        let success = !service_is_active(&final_state);
        Ok(ServiceResult {
            success,
            service: name.to_string(),
            previous_state,
            final_state,
            method,
            duration: started.elapsed(),
            error: if success {
                None
            } else {
                error.or_else(|| Some("service still active".into()))
            },
        })
    }

    async fn send_signal(&self, pid: u32, signal: &str) -> Result<SignalResult> {
        validate_pid(u64::from(pid), OsFamily::Unix)?;
        let signal = Signal::parse(signal)?;
        match self.signals.signal(pid, signal.as_raw()) {
            Ok(()) => {
                debug!(pid, %signal, "signal delivered");
                Ok(SignalResult {
                    success: true,
                    pid,
                    signal,
                    error: None,
                })
            }
            Err(SignalError::NoSuchProcess) => Ok(SignalResult {
                success: false,
                pid,
                signal,
                error: Some("no such process".to_string()),
            }),
            Err(SignalError::PermissionDenied) => Err(Error::PermissionDenied { pid }),
            Err(SignalError::InvalidSignal) => Err(Error::InvalidSignal(signal.to_string())),
            Err(SignalError::Os(e)) => Err(Error::execution("send_signal", pid, e.to_string())),
        }
    }

    fn runtime_capabilities(&self) -> BTreeMap<String, bool> {
        let mut flags = BTreeMap::new();
        flags.insert(caps::SEND_SIGNAL.to_string(), true);
        flags.insert(
            caps::PROCESS_GROUP_KILL.to_string(),
            self.signals.own_process_group().is_some(),
        );
        flags.insert(
            "zombieDetection".to_string(),
            cfg!(target_os = "linux") && std::path::Path::new("/proc/self/stat").exists(),
        );
        flags
    }

    fn platform(&self) -> &PlatformInfo {
        &self.platform
    }
}
