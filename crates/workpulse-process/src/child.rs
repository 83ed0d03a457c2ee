//! Running child processes

use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    config::ProcessConfig,
    error::{ProcessError, Result},
};

/// Grace period between SIGTERM and SIGKILL
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_millis(200);

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code (None when terminated by a signal)
    pub exit_code: Option<i32>,
    /// Captured stdout (lossy UTF-8)
    pub stdout: String,
    /// Captured stderr (lossy UTF-8)
    pub stderr: String,
    /// Wall-clock run time
    pub duration: Duration,
}

impl ProcessOutput {
    /// Whether the process exited with code 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A spawned process plus the configuration it was started with
pub struct ManagedChild {
    child: Child,
    config: ProcessConfig,
    /// Pid at spawn; None if the child was already reaped
    pid: Option<u32>,
    started: Instant,
}

impl ManagedChild {
    pub(crate) fn new(child: Child, config: ProcessConfig) -> Self {
        Self {
            pid: child.id(),
            child,
            config,
            started: Instant::now(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Check if process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for exit and collect both output streams.
    ///
    /// Past the configured timeout the process tree is killed and
    /// [`ProcessError::Timeout`] is returned.
    pub async fn wait_with_output(mut self) -> Result<ProcessOutput> {
        let stdout = self.child.stdout.take().map(drain);
        let stderr = self.child.stderr.take().map(drain);

        let waited = match self.config.timeout {
            None => self.child.wait().await,
            Some(limit) => match tokio::time::timeout(limit, self.child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    warn!(pid = ?self.pid, command = %self.config.command, ?limit, "Process overran its timeout, killing");
                    if let Err(e) = self.kill_tree().await {
                        warn!(pid = ?self.pid, error = %e, "Timed out process survived kill");
                    }
                    return Err(ProcessError::Timeout {
                        command: self.config.command.clone(),
                        seconds: limit.as_secs(),
                    });
                }
            },
        };
        let status = waited.map_err(|source| ProcessError::Wait {
            command: self.config.command.clone(),
            source,
        })?;

        let output = ProcessOutput {
            exit_code: status.code(),
            stdout: collect(stdout).await,
            stderr: collect(stderr).await,
            duration: self.started.elapsed(),
        };
        debug!(
            pid = ?self.pid,
            exit_code = ?output.exit_code,
            elapsed_ms = output.duration.as_millis() as u64,
            "Process exited"
        );
        Ok(output)
    }

    /// Kill the process and everything it started
    ///
    /// Windows delegates to `taskkill /t`; Unix signals the process group,
    /// escalating from SIGTERM to SIGKILL. A reaped child has no pid and no
    /// group left to signal.
    pub async fn kill_tree(&mut self) -> Result<()> {
        let Some(pid) = self.child.id() else {
            debug!(command = %self.config.command, "Process already reaped, nothing to kill");
            return Ok(());
        };
        debug!(pid, "Killing process tree");

        #[cfg(windows)]
        {
            let pid_arg = pid.to_string();
            let killed = tokio::process::Command::new("taskkill")
                .args(["/pid", pid_arg.as_str(), "/f", "/t"])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .await;
            if let Err(e) = killed {
                debug!(pid, error = %e, "taskkill unavailable");
            }
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let group = Pid::from_raw(pid as i32);
            if killpg(group, Signal::SIGTERM).is_ok() {
                tokio::time::sleep(TERM_GRACE).await;
                let _ = killpg(group, Signal::SIGKILL);
            }
        }

        if self.is_running() {
            self.child.kill().await.map_err(|e| ProcessError::Kill {
                command: self.config.command.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

fn drain<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    handle
        .await
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ProcessManager;

    #[tokio::test]
    async fn test_captures_exit_code_and_output() {
        let config = ProcessConfig::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = ProcessManager::new().run(config).await.unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let config = ProcessConfig::new("sleep")
            .args(["10"])
            .timeout(Duration::from_millis(100));

        let started = Instant::now();
        let result = ProcessManager::new().run(config).await;

        assert!(matches!(result, Err(ProcessError::Timeout { ref command, .. }) if command == "sleep"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_kills_grandchildren() {
        let config = ProcessConfig::new("sh")
            .args(["-c", "sleep 30; echo done"])
            .timeout(Duration::from_millis(100));

        let started = Instant::now();
        let result = ProcessManager::new().run(config).await;

        assert!(matches!(result, Err(ProcessError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_kill_tree_stops_running_child() {
        let mut child = ProcessManager::new()
            .spawn(ProcessConfig::new("sleep").args(["5"]))
            .await
            .unwrap();
        assert!(child.is_running());
        child.kill_tree().await.unwrap();
        assert!(!child.is_running());
    }

    #[tokio::test]
    async fn test_kill_tree_after_reap_signals_nothing() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        assert!(child.id().is_none());

        let mut managed = ManagedChild::new(child, ProcessConfig::new("true"));
        assert_eq!(managed.pid(), None);
        managed.kill_tree().await.unwrap();
        assert!(!managed.is_running());
    }

    #[tokio::test]
    async fn test_kill_tree_after_exit_is_noop() {
        let mut child = ProcessManager::new()
            .spawn(ProcessConfig::new("true"))
            .await
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while child.is_running() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(child.pid().is_some());
        child.kill_tree().await.unwrap();
    }
}
