//! Configuration manager implementation

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use tracing::debug;

use crate::{
    error::{ConfigError, Result},
    types::AgentConfig,
};

/// Default prefix for environment overrides (`WORKPULSE_UPDATES__ENDPOINT`)
pub const ENV_PREFIX: &str = "WORKPULSE";

/// Loads, validates and saves the updater configuration
///
/// Sources are layered: built-in defaults, then the TOML file (if present),
/// then environment variables.
pub struct ConfigManager {
    /// Configuration file path
    config_path: PathBuf,
    /// Environment prefix
    env_prefix: String,
}

impl ConfigManager {
    /// Create a manager for the default config file
    pub fn new() -> Self {
        Self::with_path(Self::default_config_path())
    }

    /// Create with custom config path
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            config_path: path,
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    /// Use a different environment prefix
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Config file this manager reads and writes
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Get default config path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("workpulse")
            .join("agent.toml")
    }

    /// Load the layered configuration
    pub fn load_config(&self) -> Result<AgentConfig> {
        debug!(path = %self.config_path.display(), prefix = %self.env_prefix, "Loading configuration");

        let builder = Config::builder()
            .add_source(
                File::from(self.config_path.clone())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(&self.env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        let agent_config: AgentConfig = config.try_deserialize()?;
        Ok(agent_config)
    }

    /// Load and validate in one step
    pub fn load_validated(&self) -> Result<AgentConfig> {
        let config = self.load_config()?;
        self.validate_config(&config)?;
        Ok(config)
    }

    /// Write `config` to the config file as TOML
    pub fn save_config(&self, config: &AgentConfig) -> Result<()> {
        let toml = Self::render(config)?;
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.config_path, toml)?;
        Ok(())
    }

    /// Render `config` as TOML
    pub fn render(config: &AgentConfig) -> Result<String> {
        Ok(toml::to_string_pretty(config)?)
    }

    /// Reject configurations the updater cannot run with
    pub fn validate_config(&self, config: &AgentConfig) -> Result<()> {
        if config.agent.service_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "agent.service_name must not be empty".to_string(),
            ));
        }
        if config.agent.install_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "agent.install_dir must not be empty".to_string(),
            ));
        }
        if config.agent.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "agent.data_dir must not be empty".to_string(),
            ));
        }
        if config.agent.data_dir.starts_with(&config.agent.install_dir) {
            // Backups would snapshot themselves and the installer could wipe them.
            return Err(ConfigError::Validation(
                "agent.data_dir must not be inside agent.install_dir".to_string(),
            ));
        }
        if let Some(version) = &config.agent.installed_version {
            workpulse_updates::VersionIdentifier::parse(version)?;
        }
        config.updates.validate()?;
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
