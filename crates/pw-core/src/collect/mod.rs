//! Native command execution and process-listing parsers.

pub mod ps;
pub mod tool_runner;
pub mod types;
pub mod windows;

pub use tool_runner::{CommandRunner, ToolConfig, ToolError, ToolOutput, ToolRunner, ToolSpec};
pub use types::{ParsedListing, ProcessRecord, ProcessState, ResourceUsage};
