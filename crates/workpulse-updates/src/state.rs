//! Update lifecycle state machine
//!
//! `UpdateState::apply` is the only way to move between states. Anything it
//! does not list is rejected, so the orchestrator cannot skip the backup or
//! report success after a failed install.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};

/// Why an update attempt ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Metadata endpoint unreachable or returned garbage
    Metadata,
    /// Download failed or retries exhausted
    Download,
    /// Checksum or signature rejected
    Integrity,
    /// No usable rollback point could be produced
    Backup,
    /// Installer could not be started; nothing was changed
    Install,
    /// Restore after a failed install did not complete; the installation is
    /// in an unknown state and needs manual intervention
    RollbackFailed,
}

impl FailureKind {
    /// Whether an operator has to repair the endpoint by hand
    pub fn requires_intervention(self) -> bool {
        matches!(self, FailureKind::RollbackFailed)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Metadata => "metadata",
            FailureKind::Download => "download",
            FailureKind::Integrity => "integrity",
            FailureKind::Backup => "backup",
            FailureKind::Install => "install",
            FailureKind::RollbackFailed => "rollback-failed",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of the update engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum UpdateState {
    #[default]
    Idle,
    CheckingForUpdate,
    UpdateAvailable,
    Downloading,
    Downloaded,
    BackupInProgress,
    BackupCompleted,
    Installing,
    Installed,
    RestartRequired,
    RollingBack,
    RolledBack,
    Failed { kind: FailureKind },
    Cancelled,
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEvent {
    CheckStarted,
    NoUpdate,
    UpdateFound,
    DownloadStarted,
    DownloadVerified,
    BackupStarted,
    BackupFinished,
    InstallStarted,
    InstallSucceeded,
    RestartPending,
    InstallFailed,
    RollbackSucceeded,
    Fail(FailureKind),
    Cancel,
    /// Abandon an interrupted pre-install step (crash recovery)
    Reset,
}

impl UpdateState {
    /// Compute the next state, or reject the event
    pub fn apply(self, event: UpdateEvent) -> Result<UpdateState> {
        use UpdateEvent as E;
        use UpdateState as S;

        let next = match (self, event) {
            (s, E::CheckStarted) if s.can_start_cycle() => S::CheckingForUpdate,
            (S::CheckingForUpdate, E::NoUpdate) => S::Idle,
            (S::CheckingForUpdate, E::UpdateFound) => S::UpdateAvailable,
            (S::UpdateAvailable, E::DownloadStarted) => S::Downloading,
            (S::Downloading, E::DownloadVerified) => S::Downloaded,
            (S::Downloaded, E::BackupStarted) => S::BackupInProgress,
            (S::BackupInProgress, E::BackupFinished) => S::BackupCompleted,
            (S::BackupCompleted, E::InstallStarted) => S::Installing,
            (S::Installing, E::InstallSucceeded) => S::Installed,
            (S::Installing, E::RestartPending) => S::RestartRequired,
            (S::Installing, E::InstallFailed) => S::RollingBack,
            (S::RollingBack, E::RollbackSucceeded) => S::RolledBack,
            (S::RollingBack, E::Fail(FailureKind::RollbackFailed)) => S::Failed {
                kind: FailureKind::RollbackFailed,
            },
            (s, E::Fail(kind))
                if s.is_pre_install() && kind != FailureKind::RollbackFailed =>
            {
                S::Failed { kind }
            }
            (s, E::Cancel) if s == S::Idle || s.is_pre_install() => S::Cancelled,
            (s, E::Reset) if s.is_pre_install() => S::Idle,
            (from, event) => return Err(UpdateError::InvalidTransition { from, event }),
        };
        Ok(next)
    }

    /// Final outcome of a cycle
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateState::Installed
                | UpdateState::RestartRequired
                | UpdateState::RolledBack
                | UpdateState::Failed { .. }
                | UpdateState::Cancelled
        )
    }

    /// States where the installation has not been touched yet
    pub fn is_pre_install(self) -> bool {
        matches!(
            self,
            UpdateState::CheckingForUpdate
                | UpdateState::UpdateAvailable
                | UpdateState::Downloading
                | UpdateState::Downloaded
                | UpdateState::BackupInProgress
                | UpdateState::BackupCompleted
        )
    }

    /// States in which cancellation must wait for the outcome
    pub fn defers_cancellation(self) -> bool {
        matches!(self, UpdateState::Installing | UpdateState::RollingBack)
    }

    /// Whether a new check may begin from this state
    pub fn can_start_cycle(self) -> bool {
        matches!(self, UpdateState::Idle | UpdateState::UpdateAvailable) || self.is_terminal()
    }

    /// Baseline overall progress shown when entering the state
    pub fn progress_baseline(self) -> u8 {
        match self {
            UpdateState::Idle | UpdateState::CheckingForUpdate => 0,
            UpdateState::UpdateAvailable => 5,
            UpdateState::Downloading => 10,
            UpdateState::Downloaded => 60,
            UpdateState::BackupInProgress => 65,
            UpdateState::BackupCompleted => 75,
            UpdateState::Installing => 80,
            UpdateState::RollingBack => 90,
            UpdateState::Installed
            | UpdateState::RestartRequired
            | UpdateState::RolledBack
            | UpdateState::Failed { .. }
            | UpdateState::Cancelled => 100,
        }
    }

    /// Whether byte counters are meaningful in this state
    pub fn tracks_download(self) -> bool {
        matches!(self, UpdateState::Downloading | UpdateState::Downloaded)
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateState::Failed { kind } => write!(f, "Failed({kind})"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl fmt::Display for UpdateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
