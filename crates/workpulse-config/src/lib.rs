//! WorkPulse updater configuration
//!
//! Loads the agent updater's settings from an optional TOML file layered
//! under `WORKPULSE_*` environment variables, and validates them before the
//! update engine starts.

pub mod error;
pub mod manager;
pub mod types;

pub use error::{ConfigError, Result};
pub use manager::{ConfigManager, ENV_PREFIX};
pub use types::{AgentConfig, AgentSection, LogFormat, LoggingConfig};
