//! Error types for procward.
//!
//! This module provides structured error handling with:
//! - Stable error codes for machine parsing
//! - Category classification for error grouping
//! - Recoverability hints for automation
//! - Remediation suggestions for humans
//!
//! Not-found conditions are deliberately absent: a kill aimed at a missing
//! process is a successful no-op, and a lookup of a missing process yields
//! `None`. Only validation, execution, platform and I/O failures are errors.
//!
//! # Agent-Facing Output
//!
//! Errors serialize to structured JSON through [`ErrorReport`]:
//! ```json
//! {
//!   "code": 20,
//!   "category": "execution",
//!   "message": "kill_by_pid failed for 4242: taskkill exited with status 128",
//!   "recoverable": true
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for procward operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad input rejected before touching the OS.
    Validation,
    /// A native command failed, timed out, or produced unusable output.
    Execution,
    /// The platform lacks a capability or could not be identified.
    Platform,
    /// Configuration file errors.
    Config,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Execution => write!(f, "execution"),
            ErrorCategory::Platform => write!(f, "platform"),
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for procward.
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors (10-19)
    #[error("invalid pid {pid}: {reason}")]
    InvalidPid { pid: u64, reason: String },

    #[error("invalid signal '{0}'")]
    InvalidSignal(String),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("pattern '{pattern}' matched {found} processes, above the limit of {limit}")]
    TooManyMatches {
        pattern: String,
        found: usize,
        limit: usize,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    // Execution errors (20-29)
    #[error("{operation} failed for {target}: {message}")]
    Execution {
        operation: String,
        target: String,
        message: String,
    },

    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("permission denied signaling process {pid}")]
    PermissionDenied { pid: u32 },

    // Platform errors (30-39)
    #[error("{operation} is not supported on {platform}")]
    Unsupported { operation: String, platform: String },

    #[error("platform detection failed: {0}")]
    Detection(String),

    #[error("process provider is not initialized")]
    NotInitialized,

    // Config and I/O errors (40-49)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build an execution error naming the operation, target and cause.
    pub fn execution(
        operation: impl Into<String>,
        target: impl std::fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Error::Execution {
            operation: operation.into(),
            target: target.to_string(),
            message: message.into(),
        }
    }

    /// Build an unsupported-operation error.
    pub fn unsupported(operation: impl Into<String>, platform: impl Into<String>) -> Self {
        Error::Unsupported {
            operation: operation.into(),
            platform: platform.into(),
        }
    }

    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Validation errors
    /// - 20-29: Execution errors
    /// - 30-39: Platform errors
    /// - 40-49: Configuration and I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::InvalidPid { .. } => 10,
            Error::InvalidSignal(_) => 11,
            Error::InvalidPattern { .. } => 12,
            Error::TooManyMatches { .. } => 13,
            Error::Validation(_) => 14,
            Error::Execution { .. } => 20,
            Error::Timeout { .. } => 21,
            Error::PermissionDenied { .. } => 22,
            Error::Unsupported { .. } => 30,
            Error::Detection(_) => 31,
            Error::NotInitialized => 32,
            Error::Config(_) => 40,
            Error::Io(_) => 41,
            Error::Json(_) => 42,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidPid { .. }
            | Error::InvalidSignal(_)
            | Error::InvalidPattern { .. }
            | Error::TooManyMatches { .. }
            | Error::Validation(_) => ErrorCategory::Validation,

            Error::Execution { .. } | Error::Timeout { .. } | Error::PermissionDenied { .. } => {
                ErrorCategory::Execution
            }

            Error::Unsupported { .. } | Error::Detection(_) | Error::NotInitialized => {
                ErrorCategory::Platform
            }

            Error::Config(_) => ErrorCategory::Config,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Whether the error was raised before any OS interaction.
    pub fn is_validation(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }

    /// Returns whether this error is potentially recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Validation: fix the input and retry
            Error::InvalidPid { .. }
            | Error::InvalidSignal(_)
            | Error::InvalidPattern { .. }
            | Error::Validation(_) => true,
            Error::TooManyMatches { .. } => true, // Narrow the pattern or raise the limit

            Error::Execution { .. } => true,
            Error::Timeout { .. } => true,
            Error::PermissionDenied { .. } => true, // Can elevate

            Error::Unsupported { .. } => false,
            Error::Detection(_) => false,
            Error::NotInitialized => true,

            Error::Config(_) => true,
            Error::Io(_) => true,
            Error::Json(_) => false,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::InvalidPid { .. } => "Pass a positive process id within the platform range.",
            Error::InvalidSignal(_) => {
                "Use a signal name (TERM, SIGKILL) or a number between 1 and 64."
            }
            Error::InvalidPattern { .. } => {
                "Use a non-empty name, or a valid regular expression with --regex."
            }
            Error::TooManyMatches { .. } => {
                "Narrow the pattern, or raise --max if every match really should be killed."
            }
            Error::Validation(_) => "Check the arguments and retry.",
            Error::Execution { .. } => {
                "Retry the operation. Run 'procward detect --refresh' if tools changed."
            }
            Error::Timeout { .. } => "Retry with a larger --timeout-ms.",
            Error::PermissionDenied { .. } => {
                "Run with elevated privileges (sudo, or an administrator shell on Windows)."
            }
            Error::Unsupported { .. } => {
                "This operation needs a tool or capability missing on this platform. See 'procward capabilities'."
            }
            Error::Detection(_) => "The operating system could not be identified.",
            Error::NotInitialized => "Initialize the provider before issuing operations.",
            Error::Config(_) => "Check the configuration file syntax and values.",
            Error::Io(_) => "Check permissions and disk space, then retry.",
            Error::Json(_) => "Report this as a bug with the failing input.",
        }
    }

    /// Structured form for JSON output.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            category: self.category(),
            message: self.to_string(),
            recoverable: self.is_recoverable(),
            remediation: self.remediation().to_string(),
        }
    }
}

/// Serializable error summary for machine consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: u32,
    pub category: ErrorCategory,
    pub message: String,
    pub recoverable: bool,
    pub remediation: String,
}
