//! Unattended installer invocation

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use workpulse_process::{ProcessConfig, ProcessError, ProcessManager};

use crate::error::{Result, UpdateError};
use crate::service::ServiceControl;

/// Default MSI exit codes meaning "installed, reboot pending"
pub const DEFAULT_REBOOT_EXIT_CODES: &[i32] = &[3010, 1641];

/// Installer program and arguments
///
/// Custom arguments may contain `{artifact}` and `{log}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InstallerCommand {
    /// `msiexec /i <artifact> /qn /norestart /l*v <log>`
    #[default]
    Msi,
    /// Any other installer
    Custom {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl InstallerCommand {
    /// Process configuration for installing `artifact`, logging to `log`
    pub fn to_process_config(&self, artifact: &Path, log: &Path) -> ProcessConfig {
        let artifact = artifact.display().to_string();
        let log = log.display().to_string();

        match self {
            InstallerCommand::Msi => ProcessConfig::new("msiexec").args([
                "/i".to_string(),
                artifact,
                "/qn".to_string(),
                "/norestart".to_string(),
                "/l*v".to_string(),
                log,
            ]),
            InstallerCommand::Custom { program, args } => ProcessConfig::new(program).args(
                args.iter()
                    .map(|arg| arg.replace("{artifact}", &artifact).replace("{log}", &log)),
            ),
        }
    }
}

/// Successful installer outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Installed; the service can be restarted
    Success,
    /// Installed; the machine must reboot to finish
    RebootRequired,
}

/// Details of a successful installer run
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub outcome: InstallOutcome,
    pub exit_code: i32,
    pub log_path: PathBuf,
    pub duration: Duration,
}

/// Runs the installer for a verified artifact
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install `artifact`. Every failure, including timeouts and exit codes
    /// outside the success and reboot sets, is an `UpdateError::Install`.
    async fn install(&self, artifact: &Path) -> Result<InstallReport>;
}

/// Installer backed by a child process
pub struct InstallationExecutor {
    command: InstallerCommand,
    success_exit_codes: Vec<i32>,
    reboot_exit_codes: Vec<i32>,
    timeout: Duration,
    log_dir: PathBuf,
    service: Option<Arc<dyn ServiceControl>>,
    processes: ProcessManager,
}

impl InstallationExecutor {
    /// Create an executor writing installer logs into `log_dir`
    pub fn new(command: InstallerCommand, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            success_exit_codes: vec![0],
            reboot_exit_codes: DEFAULT_REBOOT_EXIT_CODES.to_vec(),
            timeout: Duration::from_secs(30 * 60),
            log_dir: log_dir.into(),
            service: None,
            processes: ProcessManager::new(),
        }
    }

    /// Exit codes treated as success
    pub fn with_success_codes(mut self, codes: Vec<i32>) -> Self {
        self.success_exit_codes = codes;
        self
    }

    /// Exit codes treated as "reboot pending"
    pub fn with_reboot_codes(mut self, codes: Vec<i32>) -> Self {
        self.reboot_exit_codes = codes;
        self
    }

    /// Kill the installer after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Stop this service before launching the installer
    pub fn stop_service_before_install(mut self, service: Arc<dyn ServiceControl>) -> Self {
        self.service = Some(service);
        self
    }

    /// Map an exit code onto an outcome; `None` means failure
    pub fn classify(&self, exit_code: i32) -> Option<InstallOutcome> {
        if self.success_exit_codes.contains(&exit_code) {
            Some(InstallOutcome::Success)
        } else if self.reboot_exit_codes.contains(&exit_code) {
            Some(InstallOutcome::RebootRequired)
        } else {
            None
        }
    }

    fn log_path(&self, artifact: &Path) -> PathBuf {
        let stem = artifact
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "installer".to_string());
        self.log_dir.join(format!("{stem}-install.log"))
    }
}

#[async_trait]
impl Installer for InstallationExecutor {
    async fn install(&self, artifact: &Path) -> Result<InstallReport> {
        if !artifact.is_file() {
            return Err(UpdateError::install(format!(
                "artifact {} not found",
                artifact.display()
            )));
        }
        tokio::fs::create_dir_all(&self.log_dir).await?;

        if let Some(service) = &self.service {
            service.stop().await.map_err(|e| {
                UpdateError::install(format!("cannot stop service before install: {e}"))
            })?;
        }

        let log_path = self.log_path(artifact);
        let mut config = self
            .command
            .to_process_config(artifact, &log_path)
            .timeout(self.timeout);
        if let Some(dir) = artifact.parent().filter(|d| !d.as_os_str().is_empty()) {
            config = config.working_dir(dir);
        }
        info!(command = %config.display_command(), "Launching installer");

        let output = self.processes.run(config).await.map_err(|e| match e {
            ProcessError::Timeout { seconds, .. } => {
                UpdateError::install(format!("installer timed out after {seconds}s"))
            }
            other => UpdateError::install(format!("cannot run installer: {other}")),
        })?;

        if !output.stdout.trim().is_empty() {
            debug!(stdout = %output.stdout.trim(), "Installer output");
        }

        let Some(exit_code) = output.exit_code else {
            return Err(UpdateError::install("installer terminated by a signal"));
        };

        match self.classify(exit_code) {
            Some(outcome) => {
                info!(exit_code, ?outcome, elapsed_ms = output.duration.as_millis() as u64, "Installer finished");
                Ok(InstallReport {
                    outcome,
                    exit_code,
                    log_path,
                    duration: output.duration,
                })
            }
            None => {
                warn!(exit_code, stderr = %output.stderr.trim(), log = %log_path.display(), "Installer failed");
                Err(UpdateError::install(format!(
                    "installer exited with code {exit_code} (log: {})",
                    log_path.display()
                )))
            }
        }
    }
}
