//! procward configuration loading and validation.
//!
//! This crate provides:
//! - Typed Rust structs for the procward configuration file (JSON or TOML)
//! - Config resolution (CLI → env → XDG → /etc → defaults)
//! - Semantic validation

pub mod resolve;
pub mod settings;
pub mod validate;

pub use resolve::{load_config, resolve_config_path, ConfigSource, LoadedConfig};
pub use settings::{
    DetectorSettings, FacadeSettings, KillSettings, OptimizerSettings, ProcwardConfig,
    RunnerSettings,
};
pub use validate::{validate_config, ConfigError, ConfigResult};
