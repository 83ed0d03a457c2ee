//! Configuration types for the agent updater

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use workpulse_http::HttpConfig;
use workpulse_updates::{UpdatePaths, UpdateSettings};

/// Complete updater configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent installation and service
    pub agent: AgentSection,
    /// Update engine
    pub updates: UpdateSettings,
    /// Outbound HTTP
    pub http: HttpConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// On-disk layout the update engine works in
    pub fn update_paths(&self) -> UpdatePaths {
        UpdatePaths::new(&self.agent.data_dir, &self.agent.install_dir)
    }
}

/// `[agent]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSection {
    /// Name of the agent's OS service
    pub service_name: String,
    /// Directory the agent is installed in
    pub install_dir: PathBuf,
    /// Updater state: status record, downloads, backups, installer logs
    pub data_dir: PathBuf,
    /// Seeds the installed version; a newer version in the status file wins
    pub installed_version: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            service_name: "WorkPulseAgent".to_string(),
            install_dir: default_install_dir(),
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("workpulse")
                .join("updater"),
            installed_version: None,
        }
    }
}

#[cfg(windows)]
fn default_install_dir() -> PathBuf {
    PathBuf::from(r"C:\Program Files\WorkPulse\Agent")
}

#[cfg(not(windows))]
fn default_install_dir() -> PathBuf {
    PathBuf::from("/opt/workpulse/agent")
}

/// Log line format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
