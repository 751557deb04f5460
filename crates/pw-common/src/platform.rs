//! Platform identity shared by the detector, providers and configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating system family. Every supported OS maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Unix,
    Windows,
}

impl OsFamily {
    /// Classify an OS identifier as reported by `std::env::consts::OS`.
    ///
    /// Returns `None` for identifiers outside the known table; detection
    /// treats that as fatal.
    pub fn classify(os: &str) -> Option<OsFamily> {
        match os {
            "linux" | "macos" | "freebsd" | "openbsd" | "netbsd" | "dragonfly" | "solaris"
            | "illumos" | "android" => Some(OsFamily::Unix),
            "windows" => Some(OsFamily::Windows),
            _ => None,
        }
    }

    /// Provider implementation that serves this family.
    pub fn provider_kind(&self) -> ProviderKind {
        match self {
            OsFamily::Unix => ProviderKind::Unix,
            OsFamily::Windows => ProviderKind::Windows,
        }
    }

    /// Largest pid value the family's kill primitives accept.
    pub fn max_pid(&self) -> u64 {
        match self {
            // pid_t is a signed 32-bit integer
            OsFamily::Unix => i32::MAX as u64,
            OsFamily::Windows => u32::MAX as u64,
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Unix => write!(f, "unix"),
            OsFamily::Windows => write!(f, "windows"),
        }
    }
}

/// Concrete provider selected for a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Unix,
    Windows,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Unix => write!(f, "unix"),
            ProviderKind::Windows => write!(f, "windows"),
        }
    }
}
