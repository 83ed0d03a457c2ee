//! Process configuration

use std::path::PathBuf;
use std::time::Duration;

/// What to run and how long to let it run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Program to execute, resolved through `PATH`
    pub command: String,
    pub args: Vec<String>,
    /// Working directory (None = inherit)
    pub working_dir: Option<PathBuf>,
    /// Kill the process tree after this long (None = wait forever)
    pub timeout: Option<Duration>,
}

impl ProcessConfig {
    /// Create new process configuration
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: None,
        }
    }

    /// Set command arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Command line as a single display string, for logs
    pub fn display_command(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = ProcessConfig::new("msiexec")
            .args(["/i", "agent.msi"])
            .working_dir("/tmp/downloads")
            .timeout(Duration::from_secs(30));

        assert_eq!(config.args, vec!["/i", "agent.msi"]);
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp/downloads")));
        assert_eq!(config.display_command(), "msiexec /i agent.msi");
    }

    #[test]
    fn test_defaults_inherit_everything() {
        let config = ProcessConfig::new("systemctl");
        assert!(config.args.is_empty());
        assert_eq!(config.working_dir, None);
        assert_eq!(config.timeout, None);
    }
}
