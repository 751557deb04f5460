//! Exit codes for the procward CLI.
//!
//! Exit codes communicate operation outcome without requiring output parsing.
//!
//! Exit code ranges:
//! - 0-1: Operational outcomes
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors (bugs, should be reported)

use pw_common::{Error, ErrorCategory};

/// Exit codes for procward operations. Stable contract for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Operation completed and achieved its goal.
    Clean = 0,

    /// Operation ran but some targets survived or were refused.
    PartialFail = 1,

    /// Invalid arguments, pid, signal or pattern.
    ArgsError = 10,

    /// Operation unsupported on this platform or detection failed.
    CapabilityError = 11,

    /// Permission denied.
    PermissionError = 12,

    /// Internal error, native command failure or I/O failure.
    InternalError = 20,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Clean
    }

    /// Codes 10-19: resolvable by the user.
    pub fn is_user_error(self) -> bool {
        (10..20).contains(&(self as i32))
    }

    pub fn is_error(self) -> bool {
        (self as i32) >= 10
    }

    /// Get the code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK",
            ExitCode::PartialFail => "ERR_PARTIAL",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::CapabilityError => "ERR_CAPABILITY",
            ExitCode::PermissionError => "ERR_PERMISSION",
            ExitCode::InternalError => "ERR_INTERNAL",
        }
    }

    /// Exit code for an operation that produced `succeeded`.
    pub fn for_outcome(succeeded: bool) -> Self {
        if succeeded {
            ExitCode::Clean
        } else {
            ExitCode::PartialFail
        }
    }
}

impl From<&Error> for ExitCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::PermissionDenied { .. } => ExitCode::PermissionError,
            Error::NotInitialized => ExitCode::InternalError,
            other => match other.category() {
                ErrorCategory::Validation | ErrorCategory::Config => ExitCode::ArgsError,
                ErrorCategory::Platform => ExitCode::CapabilityError,
                ErrorCategory::Execution | ErrorCategory::Io => ExitCode::InternalError,
            },
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ExitCode::Clean.as_i32(), 0);
        assert_eq!(ExitCode::PartialFail.as_i32(), 1);
        assert_eq!(ExitCode::ArgsError.as_i32(), 10);
        assert_eq!(ExitCode::CapabilityError.as_i32(), 11);
        assert_eq!(ExitCode::PermissionError.as_i32(), 12);
        assert_eq!(ExitCode::InternalError.as_i32(), 20);
    }

    #[test]
    fn test_error_mapping() {
        let invalid = Error::InvalidSignal("BOGUS".into());
        assert_eq!(ExitCode::from(&invalid), ExitCode::ArgsError);
        let denied = Error::PermissionDenied { pid: 1 };
        assert_eq!(ExitCode::from(&denied), ExitCode::PermissionError);
        let unsupported = Error::unsupported("send_signal", "windows");
        assert_eq!(ExitCode::from(&unsupported), ExitCode::CapabilityError);
        let failed = Error::execution("kill_by_pid", 4, "boom");
        assert_eq!(ExitCode::from(&failed), ExitCode::InternalError);
    }

    #[test]
    fn test_classification() {
        assert!(ExitCode::Clean.is_success());
        assert!(!ExitCode::PartialFail.is_error());
        assert!(ExitCode::PermissionError.is_user_error());
        assert!(!ExitCode::InternalError.is_user_error());
        assert_eq!(ExitCode::ArgsError.to_string(), "ERR_ARGS (10)");
    }
}
