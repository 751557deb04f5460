//! procward common types, signals, and errors.
//!
//! This crate provides foundational types shared across procward crates:
//! - Platform family and provider identity
//! - Signal catalog with name/number normalization
//! - Common error types with stable codes
//! - Output format specifications

pub mod error;
pub mod output;
pub mod platform;
pub mod signal;

pub use error::{Error, ErrorCategory, ErrorReport, Result};
pub use output::OutputFormat;
pub use platform::{OsFamily, ProviderKind};
pub use signal::{Signal, MAX_SIGNAL};
