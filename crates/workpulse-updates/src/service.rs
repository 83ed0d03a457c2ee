//! Control of the service hosting the agent

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use workpulse_process::{ProcessConfig, ProcessManager};

use crate::error::{Result, UpdateError};

/// `sc.exe` exit codes for "already stopped" and "already running"
const SC_SERVICE_NOT_ACTIVE: i32 = 1062;
const SC_SERVICE_ALREADY_RUNNING: i32 = 1056;

/// Stop/start access to the hosting service
#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// Service name
    fn name(&self) -> &str;

    /// Stop the service; stopping a stopped service succeeds
    async fn stop(&self) -> Result<()>;

    /// Start the service; starting a running service succeeds
    async fn start(&self) -> Result<()>;
}

/// Drives the platform service manager (`sc.exe` or `systemctl`)
#[derive(Debug, Clone)]
pub struct SystemServiceControl {
    name: String,
    program: String,
    timeout: Duration,
    processes: ProcessManager,
}

impl SystemServiceControl {
    /// Control `name` through the platform's service manager
    pub fn new(name: impl Into<String>) -> Self {
        let program = if cfg!(windows) { "sc.exe" } else { "systemctl" };
        Self {
            name: name.into(),
            program: program.to_string(),
            timeout: Duration::from_secs(60),
            processes: ProcessManager::new(),
        }
    }

    /// Use another service manager executable
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Bound each stop/start command
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn control(&self, action: &str, tolerated_code: i32) -> Result<()> {
        let config = ProcessConfig::new(&self.program)
            .args([action, self.name.as_str()])
            .timeout(self.timeout);
        debug!(command = %config.display_command(), "Running service control command");

        let output = self.processes.run(config).await.map_err(|e| {
            UpdateError::service(format!("{action} {}: {e}", self.name))
        })?;

        match output.exit_code {
            Some(0) => Ok(()),
            Some(code) if cfg!(windows) && code == tolerated_code => {
                debug!(service = %self.name, action, code, "Service already in requested state");
                Ok(())
            }
            code => {
                let detail = if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                };
                Err(UpdateError::service(format!(
                    "{action} {} exited with {}: {detail}",
                    self.name,
                    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
                )))
            }
        }
    }
}

#[async_trait]
impl ServiceControl for SystemServiceControl {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stop(&self) -> Result<()> {
        info!(service = %self.name, "Stopping service");
        self.control("stop", SC_SERVICE_NOT_ACTIVE).await
    }

    async fn start(&self) -> Result<()> {
        info!(service = %self.name, "Starting service");
        self.control("start", SC_SERVICE_ALREADY_RUNNING).await
    }
}

/// For agents not running under a service manager
#[derive(Debug, Clone, Default)]
pub struct NoopServiceControl;

#[async_trait]
impl ServiceControl for NoopServiceControl {
    fn name(&self) -> &str {
        "none"
    }

    async fn stop(&self) -> Result<()> {
        warn!("No service manager configured, skipping stop");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        debug!("No service manager configured, skipping start");
        Ok(())
    }
}
