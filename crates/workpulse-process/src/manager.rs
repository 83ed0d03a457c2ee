//! Spawning managed processes

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::{
    child::{ManagedChild, ProcessOutput},
    config::ProcessConfig,
    error::{ProcessError, Result},
};

/// Starts unattended child processes
///
/// Children get no stdin and have both output streams captured. On Unix each
/// child leads its own process group so a timeout can take down everything
/// it started.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessManager;

impl ProcessManager {
    pub fn new() -> Self {
        Self
    }

    /// Spawn a managed process
    pub async fn spawn(&self, config: ProcessConfig) -> Result<ManagedChild> {
        if config.command.trim().is_empty() {
            return Err(ProcessError::InvalidConfig("command is empty".to_string()));
        }
        debug!(command = %config.display_command(), "Spawning process");

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: config.command.clone(),
            source,
        })?;
        info!(pid = ?child.id(), command = %config.command, "Process spawned");

        Ok(ManagedChild::new(child, config))
    }

    /// Spawn a process and wait for it, honouring the configured timeout
    ///
    /// # Examples
    /// ```no_run
    /// use workpulse_process::{ProcessManager, ProcessConfig};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let output = ProcessManager::new()
    ///     .run(ProcessConfig::new("sc.exe").args(["stop", "WorkPulseAgent"]))
    ///     .await?;
    /// assert!(output.success());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run(&self, config: ProcessConfig) -> Result<ProcessOutput> {
        self.spawn(config).await?.wait_with_output().await
    }
}
