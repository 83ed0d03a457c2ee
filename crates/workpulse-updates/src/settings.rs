//! Update engine settings

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use workpulse_http::RetryConfig;

use crate::error::{Result, UpdateError};
use crate::installer::{InstallerCommand, DEFAULT_REBOOT_EXIT_CODES};
use crate::policy::MaintenanceWindowSpec;

/// `[updates]` configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    /// Run the background update loop
    pub enabled: bool,
    /// Base URL of the update API
    pub endpoint: String,
    /// Seconds between scheduled checks
    pub check_interval_secs: u64,
    /// Retries per phase for transient failures
    pub max_retries: u32,
    /// First backoff delay, doubled per retry
    pub retry_base_delay_secs: u64,
    /// Backoff ceiling
    pub retry_max_delay_secs: u64,
    /// Longest wait for the next chunk of a download
    pub download_idle_timeout_secs: u64,
    /// Longest a whole download may take
    pub download_timeout_secs: u64,
    /// Longest the installer may run
    pub installer_timeout_secs: u64,
    /// Accept pre-release descriptors
    pub allow_prerelease: bool,
    /// Backups older than this are swept
    pub backup_retention_days: u32,
    /// Newest backups kept (0 = no cap)
    pub max_backups: usize,
    /// A failed backup may fall back to one of the same version this recent
    pub reuse_backup_within_hours: u32,
    /// Trusted publisher certificates; `<data_dir>/trust.json` when unset
    pub trust_store_path: Option<PathBuf>,
    /// Installer invocation
    pub installer: InstallerCommand,
    pub success_exit_codes: Vec<i32>,
    pub reboot_exit_codes: Vec<i32>,
    /// Stop the agent service before launching the installer
    pub stop_service_before_install: bool,
    /// When non-required updates may install
    pub maintenance: MaintenanceWindowSpec,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://updates.workpulse.local/api".to_string(),
            check_interval_secs: 3600,
            max_retries: 3,
            retry_base_delay_secs: 5,
            retry_max_delay_secs: 300,
            download_idle_timeout_secs: 60,
            download_timeout_secs: 1800,
            installer_timeout_secs: 1800,
            allow_prerelease: false,
            backup_retention_days: 30,
            max_backups: 5,
            reuse_backup_within_hours: 24,
            trust_store_path: None,
            installer: InstallerCommand::Msi,
            success_exit_codes: vec![0],
            reboot_exit_codes: DEFAULT_REBOOT_EXIT_CODES.to_vec(),
            stop_service_before_install: true,
            maintenance: MaintenanceWindowSpec::default(),
        }
    }
}

impl UpdateSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn download_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.download_idle_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn installer_timeout(&self) -> Duration {
        Duration::from_secs(self.installer_timeout_secs)
    }

    pub fn reuse_backup_within(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.reuse_backup_within_hours))
    }

    /// Backoff policy shared by metadata checks and downloads
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay: Duration::from_secs(self.retry_base_delay_secs),
            max_delay: Duration::from_secs(self.retry_max_delay_secs),
            backoff_multiplier: 2.0,
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(UpdateError::config("updates.endpoint must not be empty"));
        }
        url::Url::parse(&self.endpoint)
            .map_err(|e| UpdateError::config(format!("updates.endpoint is not a URL: {e}")))?;
        if self.check_interval_secs == 0 {
            return Err(UpdateError::config("updates.check_interval_secs must be positive"));
        }
        if self.backup_retention_days == 0 {
            return Err(UpdateError::config("updates.backup_retention_days must be positive"));
        }
        if self.retry_max_delay_secs < self.retry_base_delay_secs {
            return Err(UpdateError::config(
                "updates.retry_max_delay_secs must not be below retry_base_delay_secs",
            ));
        }
        if self.download_timeout_secs == 0 || self.download_idle_timeout_secs == 0 {
            return Err(UpdateError::config("download timeouts must be positive"));
        }
        if self.installer_timeout_secs == 0 {
            return Err(UpdateError::config("updates.installer_timeout_secs must be positive"));
        }
        if self.success_exit_codes.is_empty() {
            return Err(UpdateError::config("updates.success_exit_codes must not be empty"));
        }
        if let Some(code) = self
            .success_exit_codes
            .iter()
            .find(|code| self.reboot_exit_codes.contains(code))
        {
            return Err(UpdateError::config(format!(
                "exit code {code} is listed as both success and reboot"
            )));
        }
        if let InstallerCommand::Custom { program, .. } = &self.installer {
            if program.trim().is_empty() {
                return Err(UpdateError::config("updates.installer.program must not be empty"));
            }
        }
        Ok(())
    }
}

/// On-disk layout of the update engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePaths {
    /// Root for status, downloads, backups and logs
    pub data_dir: PathBuf,
    /// Agent installation being updated
    pub install_dir: PathBuf,
}

impl UpdatePaths {
    pub fn new(data_dir: impl Into<PathBuf>, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            install_dir: install_dir.into(),
        }
    }

    pub fn status_file(&self) -> PathBuf {
        self.data_dir.join("status.json")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn installer_log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Configured trust store, or the default inside the data directory
    pub fn trust_store(&self, settings: &UpdateSettings) -> PathBuf {
        settings
            .trust_store_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("trust.json"))
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }
}
