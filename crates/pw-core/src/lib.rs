//! procward core library
//!
//! Cross-platform process discovery, inspection and termination:
//! - Native command execution and listing parsers
//! - Platform and capability detection
//! - Unix and Windows providers behind one contract, plus the caching facade
//! - Operation optimization and kill batching
//! - The `ProcessController` entry point and integration hooks
//! - Logging and exit codes for the `procward` binary
//!
//! The binary entry point is in `main.rs`.

pub mod collect;
pub mod controller;
pub mod detect;
pub mod exit_codes;
pub mod integration;
pub mod logging;
pub mod optimize;
pub mod provider;

pub use controller::ProcessController;

// Re-export test utilities for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
