//! Native command runner with timeout, output cap, and allowlist controls.
//!
//! Every provider and detector invocation of `ps`, `tasklist`, `systemctl`
//! and friends goes through a [`CommandRunner`]. The production
//! implementation is [`ToolRunner`]:
//!
//! - Per-command timeout; the child is killed when it expires
//! - Output size caps to prevent memory exhaustion
//! - Command name validation to prevent injection
//! - Sanitized environment (`PATH` plus a C locale)
//!
//! # Example
//!
//! ```ignore
//! use pw_core::collect::tool_runner::{CommandRunner, ToolRunner};
//!
//! let runner = ToolRunner::with_defaults();
//! let output = runner.run_tool("ps", &["-A"], None).await?;
//! println!("{}", output.stdout_str());
//! ```

use async_trait::async_trait;
use pw_config::RunnerSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, instrument, trace, warn};

/// Default timeout per command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum output size in bytes (4MB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

/// Errors that can occur during tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("command failed to spawn: {0}")]
    SpawnFailed(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command exited with non-zero status: {code}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("command killed by signal")]
    KilledBySignal,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid command path: {0}")]
    InvalidPath(String),

    #[error("command not in allowlist: {0}")]
    NotAllowed(String),
}

impl ToolError {
    /// Whether the failure means the tool itself is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ToolError::CommandNotFound(_))
    }
}

impl From<ToolError> for pw_common::Error {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Timeout(d) => pw_common::Error::Timeout {
                operation: "native command".to_string(),
                millis: d.as_millis() as u64,
            },
            ToolError::InvalidPath(msg) => pw_common::Error::Validation(msg),
            other => pw_common::Error::execution("native command", "runner", other.to_string()),
        }
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Command that was executed.
    pub command: String,

    /// Arguments passed to the command.
    pub args: Vec<String>,

    /// Standard output (may be truncated).
    pub stdout: Vec<u8>,

    /// Standard error (may be truncated).
    pub stderr: Vec<u8>,

    /// Exit code (None when killed by a signal or timed out).
    pub exit_code: Option<i32>,

    /// Whether output was truncated.
    pub truncated: bool,

    /// Execution duration.
    pub duration: Duration,

    /// Whether the command timed out.
    pub timed_out: bool,
}

impl ToolOutput {
    /// Get stdout as string (lossy UTF-8 conversion).
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as string (lossy UTF-8 conversion).
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Convert timeouts and non-zero exits into errors.
    pub fn require_success(self) -> Result<ToolOutput, ToolError> {
        if self.timed_out {
            return Err(ToolError::Timeout(self.duration));
        }
        match self.exit_code {
            Some(0) => Ok(self),
            Some(code) => Err(ToolError::NonZeroExit {
                code,
                stderr: self.stderr_str().trim().to_string(),
            }),
            None => Err(ToolError::KilledBySignal),
        }
    }
}

/// Specification for a tool to run.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Command to execute.
    pub command: String,

    /// Arguments to pass.
    pub args: Vec<String>,

    /// Override timeout (None = use default).
    pub timeout: Option<Duration>,

    /// Override max output (None = use default).
    pub max_output: Option<usize>,
}

impl ToolSpec {
    /// Create a new tool specification.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            timeout: None,
            max_output: None,
        }
    }

    /// Set custom timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Seam between providers and the operating system.
#[async_trait]
pub trait CommandRunner: Send + Sync + std::fmt::Debug {
    /// Run a tool from a specification.
    async fn run(&self, spec: &ToolSpec) -> Result<ToolOutput, ToolError>;

    /// Run a single tool with the given command and arguments.
    async fn run_tool(
        &self,
        cmd: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<ToolOutput, ToolError> {
        let mut spec = ToolSpec::new(cmd, args.iter().map(|s| s.to_string()).collect());
        if let Some(timeout) = timeout {
            spec = spec.with_timeout(timeout);
        }
        self.run(&spec).await
    }
}

/// Configuration for the tool runner.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Default timeout per command.
    pub default_timeout: Duration,

    /// Maximum output size per stream in bytes.
    pub max_output_bytes: usize,

    /// Allowed commands (empty = all allowed).
    pub allowed_commands: HashSet<String>,

    /// Clear the child environment except for a minimal safe set.
    pub sanitize_env: bool,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            allowed_commands: HashSet::new(),
            sanitize_env: true,
        }
    }
}

impl ToolConfig {
    /// Build from the `runner` configuration section.
    pub fn from_settings(settings: &RunnerSettings) -> Self {
        Self {
            default_timeout: settings.command_timeout(),
            max_output_bytes: settings.max_output_bytes,
            allowed_commands: settings
                .allowlist
                .iter()
                .flatten()
                .cloned()
                .collect(),
            sanitize_env: settings.sanitize_env,
        }
    }
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    config: ToolConfig,
}

impl ToolRunner {
    /// Create a new tool runner with the given configuration.
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    /// Create a tool runner with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ToolConfig::default())
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    /// Validate that a command is allowed and safe to execute.
    fn validate_command(&self, cmd: &str) -> Result<(), ToolError> {
        if cmd.trim().is_empty() {
            return Err(ToolError::InvalidPath("empty command".to_string()));
        }

        // Reject commands with shell metacharacters
        if cmd.contains(['|', '&', ';', '$', '`', '<', '>', '\n', '\r']) {
            return Err(ToolError::InvalidPath(format!(
                "command contains shell metacharacters: {}",
                cmd
            )));
        }

        // Check allowlist if configured
        if !self.config.allowed_commands.is_empty() {
            let basename = Path::new(cmd)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(cmd);

            if !self.config.allowed_commands.contains(cmd)
                && !self.config.allowed_commands.contains(basename)
            {
                return Err(ToolError::NotAllowed(cmd.to_string()));
            }
        }

        // Verify command exists if it's an absolute path
        if Path::new(cmd).is_absolute() && !Path::new(cmd).exists() {
            return Err(ToolError::CommandNotFound(cmd.to_string()));
        }

        Ok(())
    }

    fn build_command(&self, cmd: &str, args: &[String]) -> Command {
        let mut command = Command::new(cmd);
        command.args(args);

        if self.config.sanitize_env {
            command.env_clear();
            if let Ok(path) = std::env::var("PATH") {
                command.env("PATH", path);
            }
            // Windows tools fail to start without these
            #[cfg(windows)]
            for key in ["SystemRoot", "windir", "PATHEXT", "COMSPEC"] {
                if let Ok(value) = std::env::var(key) {
                    command.env(key, value);
                }
            }
            command.env("LC_ALL", "C");
            command.env("LANG", "C");
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl CommandRunner for ToolRunner {
    #[instrument(skip(self), fields(cmd = %spec.command))]
    async fn run(&self, spec: &ToolSpec) -> Result<ToolOutput, ToolError> {
        self.validate_command(&spec.command)?;

        let timeout = spec.timeout.unwrap_or(self.config.default_timeout);
        let max_output = spec.max_output.unwrap_or(self.config.max_output_bytes);

        debug!(
            command = %spec.command,
            args = ?spec.args,
            timeout_ms = timeout.as_millis() as u64,
            max_output,
            "running tool"
        );

        let start = Instant::now();
        let mut child = match self.build_command(&spec.command, &spec.args).spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(command = %spec.command, "command not found");
                return Err(ToolError::CommandNotFound(spec.command.clone()));
            }
            Err(e) => {
                warn!(command = %spec.command, error = %e, "failed to spawn");
                return Err(ToolError::SpawnFailed(e.to_string()));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let collected = tokio::time::timeout(timeout, async {
            tokio::join!(
                drain_to_limit(stdout, max_output),
                drain_to_limit(stderr, max_output),
                child.wait()
            )
        })
        .await;

        let output = match collected {
            Ok((out, err, status)) => {
                let (stdout, out_truncated) = out?;
                let (stderr, err_truncated) = err?;
                let status = status?;
                ToolOutput {
                    command: spec.command.clone(),
                    args: spec.args.clone(),
                    stdout,
                    stderr,
                    exit_code: status.code(),
                    truncated: out_truncated || err_truncated,
                    duration: start.elapsed(),
                    timed_out: false,
                }
            }
            Err(_) => {
                warn!(
                    command = %spec.command,
                    timeout_ms = timeout.as_millis() as u64,
                    "command timed out, killing"
                );
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "kill after timeout failed");
                }
                let _ = child.wait().await;
                ToolOutput {
                    command: spec.command.clone(),
                    args: spec.args.clone(),
                    duration: start.elapsed(),
                    timed_out: true,
                    ..Default::default()
                }
            }
        };

        debug!(
            command = %spec.command,
            duration_ms = output.duration.as_millis() as u64,
            exit_code = ?output.exit_code,
            truncated = output.truncated,
            "tool execution complete"
        );

        Ok(output)
    }
}

/// Read a stream to EOF, keeping at most `limit` bytes.
///
/// Bytes past the limit are drained and discarded so the child never blocks
/// on a full pipe.
async fn drain_to_limit<R: AsyncRead + Unpin>(
    stream: Option<R>,
    limit: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let Some(mut stream) = stream else {
        return Ok((Vec::new(), false));
    };

    let mut buf = Vec::with_capacity(limit.min(65536));
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(buf.len());
        if room < n {
            truncated = true;
        }
        buf.extend_from_slice(&chunk[..n.min(room)]);
    }

    Ok((buf, truncated))
}

/// Builder for creating a tool runner with custom configuration.
#[derive(Debug, Default)]
pub struct ToolRunnerBuilder {
    config: ToolConfig,
}

impl ToolRunnerBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Set the maximum output size.
    pub fn max_output(mut self, max_bytes: usize) -> Self {
        self.config.max_output_bytes = max_bytes;
        self
    }

    /// Enable or disable environment sanitization.
    pub fn sanitize_env(mut self, enable: bool) -> Self {
        self.config.sanitize_env = enable;
        self
    }

    /// Add allowed commands (restrict to only these).
    pub fn allow_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for cmd in commands {
            self.config.allowed_commands.insert(cmd.into());
        }
        self
    }

    /// Build the tool runner.
    pub fn build(self) -> ToolRunner {
        ToolRunner::new(self.config)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn test_runner() -> ToolRunner {
        ToolRunnerBuilder::new().build()
    }

    #[tokio::test]
    async fn test_run_echo() {
        let runner = test_runner();
        let output = runner
            .run_tool("echo", &["hello", "world"], None)
            .await
            .expect("echo should run");

        assert!(output.success());
        assert_eq!(output.stdout_str().trim(), "hello world");
        assert!(!output.truncated);
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_run_with_stderr() {
        let runner = test_runner();
        let output = runner
            .run_tool("sh", &["-c", "echo error >&2"], None)
            .await
            .unwrap();

        assert!(output.success());
        assert!(output.stderr_str().contains("error"));
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let runner = test_runner();
        let output = runner.run_tool("sh", &["-c", "exit 42"], None).await.unwrap();

        assert!(!output.success());
        assert_eq!(output.exit_code, Some(42));
        match output.require_success() {
            Err(ToolError::NonZeroExit { code, .. }) => assert_eq!(code, 42),
            other => panic!("expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_not_found() {
        let runner = test_runner();
        let err = runner
            .run_tool("/nonexistent/command/that/does/not/exist", &[], None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = runner
            .run_tool("procward-definitely-missing-tool", &[], None)
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_invalid_path_shell_metachar() {
        let runner = test_runner();
        match runner.run_tool("echo; rm -rf /", &[], None).await {
            Err(ToolError::InvalidPath(_)) => {}
            other => panic!("expected InvalidPath, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let runner = ToolRunnerBuilder::new()
            .timeout(Duration::from_millis(100))
            .build();

        let output = runner.run_tool("sleep", &["10"], None).await.unwrap();
        assert!(output.timed_out, "expected timed_out=true, got: {:?}", output);
        assert!(output.duration < Duration::from_secs(2));
        assert!(matches!(
            output.require_success(),
            Err(ToolError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_output_truncation() {
        let runner = ToolRunnerBuilder::new().max_output(100).build();

        let output = runner
            .run_tool("sh", &["-c", "yes | head -n 1000"], None)
            .await
            .unwrap();
        assert!(output.truncated);
        assert!(output.stdout.len() <= 100);
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_allowlist() {
        let runner = ToolRunnerBuilder::new().allow_commands(["echo"]).build();

        assert!(runner.run_tool("echo", &["ok"], None).await.is_ok());
        assert!(matches!(
            runner.run_tool("sh", &["-c", "true"], None).await,
            Err(ToolError::NotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_environment_is_sanitized() {
        std::env::set_var("PROCWARD_RUNNER_LEAK_CHECK", "visible");
        let runner = test_runner();
        let output = runner.run_tool("env", &[], None).await.unwrap();
        let env = output.stdout_str();
        assert!(env.contains("LC_ALL=C"));
        assert!(!env.contains("PROCWARD_RUNNER_LEAK_CHECK"));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = RunnerSettings {
            command_timeout_ms: 1500,
            max_output_bytes: 64,
            allowlist: Some(vec!["ps".into(), "kill".into()]),
            sanitize_env: false,
        };
        let config = ToolConfig::from_settings(&settings);
        assert_eq!(config.default_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_output_bytes, 64);
        assert!(config.allowed_commands.contains("kill"));
        assert!(!config.sanitize_env);
    }
}
