//! The update transaction
//!
//! One cycle walks check → download → verify → backup → install and, when
//! the installer fails, restores the backup. Every step is reflected in the
//! [`StatusStore`] before the next one starts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use workpulse_http::{shared_client, HttpConfig, RetryConfig, RetryError, RetryMiddleware};

use crate::backup::{BackupManager, BackupRecord};
use crate::downloader::ArtifactDownloader;
use crate::error::{Result, UpdateError};
use crate::installer::{InstallOutcome, InstallationExecutor, Installer};
use crate::integrity::{IntegrityVerifier, TrustStore};
use crate::metadata::{HttpMetadataSource, MetadataSource};
use crate::models::UpdateArtifactDescriptor;
use crate::policy::{Clock, MaintenanceWindowPolicy, SystemClock};
use crate::service::ServiceControl;
use crate::settings::{UpdatePaths, UpdateSettings};
use crate::state::{FailureKind, UpdateEvent, UpdateState};
use crate::status::{StatusStore, UpdateStatusRecord};
use crate::version::VersionIdentifier;

/// Status metadata keys
const META_REQUIRED: &str = "required";
const META_SHA256: &str = "sha256";
const META_SIGNER: &str = "signer";
const META_BACKUP_FILE: &str = "backupFile";
const META_EXIT_CODE: &str = "installerExitCode";
const META_INSTALL_LOG: &str = "installerLog";
const META_FILES_RESTORED: &str = "filesRestored";

/// Collaborators of the orchestrator
pub struct OrchestratorParts {
    pub metadata: Arc<dyn MetadataSource>,
    pub downloader: ArtifactDownloader,
    pub verifier: IntegrityVerifier,
    pub backups: Arc<BackupManager>,
    pub installer: Arc<dyn Installer>,
    pub service: Arc<dyn ServiceControl>,
    pub policy: MaintenanceWindowPolicy,
    pub clock: Arc<dyn Clock>,
    pub status: Arc<StatusStore>,
}

/// Behavioural knobs of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Where artifacts are downloaded
    pub download_dir: PathBuf,
    /// Accept pre-release descriptors
    pub allow_prerelease: bool,
    /// Backoff for metadata checks and downloads
    pub retry: RetryConfig,
    /// Age limit for falling back to an existing backup
    pub reuse_backup_within: chrono::Duration,
}

/// Drives update cycles; at most one runs at a time
pub struct UpdateOrchestrator {
    metadata: Arc<dyn MetadataSource>,
    downloader: ArtifactDownloader,
    verifier: IntegrityVerifier,
    backups: Arc<BackupManager>,
    installer: Arc<dyn Installer>,
    service: Arc<dyn ServiceControl>,
    policy: MaintenanceWindowPolicy,
    clock: Arc<dyn Clock>,
    status: Arc<StatusStore>,
    retry: RetryMiddleware,
    download_dir: PathBuf,
    allow_prerelease: bool,
    reuse_backup_within: chrono::Duration,
    in_flight: Mutex<()>,
    shutdown: CancellationToken,
    current_cycle: SyncMutex<Option<CancellationToken>>,
    trigger: Notify,
}

impl UpdateOrchestrator {
    /// Assemble an orchestrator from its parts
    pub fn new(parts: OrchestratorParts, options: OrchestratorOptions) -> Self {
        Self {
            metadata: parts.metadata,
            downloader: parts.downloader,
            verifier: parts.verifier,
            backups: parts.backups,
            installer: parts.installer,
            service: parts.service,
            policy: parts.policy,
            clock: parts.clock,
            status: parts.status,
            retry: RetryMiddleware::new(options.retry),
            download_dir: options.download_dir,
            allow_prerelease: options.allow_prerelease,
            reuse_backup_within: options.reuse_backup_within,
            in_flight: Mutex::new(()),
            shutdown: CancellationToken::new(),
            current_cycle: SyncMutex::new(None),
            trigger: Notify::new(),
        }
    }

    /// Production wiring: HTTP metadata source and downloader, trust store
    /// from disk, tar.gz backups and the configured installer.
    pub fn from_settings(
        settings: &UpdateSettings,
        paths: &UpdatePaths,
        current_version: VersionIdentifier,
        http: &HttpConfig,
        service: Arc<dyn ServiceControl>,
    ) -> Result<Self> {
        settings.validate()?;
        let api = shared_client(http.clone())
            .map_err(|e| UpdateError::config(format!("cannot build HTTP client: {e}")))?;
        let transfers = shared_client(http.for_transfers())
            .map_err(|e| UpdateError::config(format!("cannot build HTTP client: {e}")))?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let status = Arc::new(StatusStore::load_or_create(
            paths.status_file(),
            current_version,
            settings.max_retries,
        )?);
        let trust_store = TrustStore::load(&paths.trust_store(settings))?;

        let backups = Arc::new(
            BackupManager::new(paths.backup_dir(), paths.install_dir(), service.clone())
                .with_retention_days(settings.backup_retention_days)
                .with_max_backups(settings.max_backups)
                .with_clock(clock.clone()),
        );

        let mut installer =
            InstallationExecutor::new(settings.installer.clone(), paths.installer_log_dir())
                .with_success_codes(settings.success_exit_codes.clone())
                .with_reboot_codes(settings.reboot_exit_codes.clone())
                .with_timeout(settings.installer_timeout());
        if settings.stop_service_before_install {
            installer = installer.stop_service_before_install(service.clone());
        }

        let parts = OrchestratorParts {
            metadata: Arc::new(HttpMetadataSource::new(api, &settings.endpoint)?),
            downloader: ArtifactDownloader::new(
                transfers,
                settings.download_idle_timeout(),
                settings.download_timeout(),
            ),
            verifier: IntegrityVerifier::new(trust_store, clock.clone()),
            backups,
            installer: Arc::new(installer),
            service,
            policy: MaintenanceWindowPolicy::new(settings.maintenance.clone()),
            clock,
            status,
        };
        let options = OrchestratorOptions {
            download_dir: paths.download_dir(),
            allow_prerelease: settings.allow_prerelease,
            retry: settings.retry_config(),
            reuse_backup_within: settings.reuse_backup_within(),
        };
        Ok(Self::new(parts, options))
    }

    /// Consistent copy of the status record
    pub fn status(&self) -> UpdateStatusRecord {
        self.status.snapshot()
    }

    /// Shared status store
    pub fn status_store(&self) -> Arc<StatusStore> {
        self.status.clone()
    }

    /// Backup manager used for rollbacks
    pub fn backups(&self) -> Arc<BackupManager> {
        self.backups.clone()
    }

    /// Ask the background loop to check now
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Abort the running cycle at its next safe point
    pub fn cancel_current(&self) {
        if let Some(token) = self.current_cycle.lock().as_ref() {
            info!("Cancelling current update cycle");
            token.cancel();
        }
    }

    /// Stop the background loop and cancel any running cycle
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled by [`UpdateOrchestrator::shutdown`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Check periodically and on [`UpdateOrchestrator::trigger`] until shut down
    pub async fn run(&self, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "Update loop started");

        match self.recover().await {
            Ok(state) => debug!(state = %state, "Startup recovery complete"),
            Err(e) => error!(error = %e, "Startup recovery failed"),
        }

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.check_and_update().await {
                Ok(state) => info!(state = %state, "Update cycle finished"),
                Err(UpdateError::Cancelled) => debug!("Update cycle cancelled before start"),
                Err(e) => error!(error = %e, "Update cycle did not run"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.trigger.notified() => debug!("Update check triggered"),
            }
        }
        info!("Update loop stopped");
    }

    /// Run one update cycle and return the state it ended in.
    ///
    /// Attempt failures end in `Failed`, `RolledBack` or `Cancelled` and are
    /// reported through the status record, not as errors. Errors mean the
    /// cycle could not run at all, e.g. [`UpdateError::Busy`].
    pub async fn check_and_update(&self) -> Result<UpdateState> {
        let _guard = self.in_flight.try_lock().map_err(|_| UpdateError::Busy {
            state: self.status.state(),
        })?;

        let state = self.status.state();
        if !state.can_start_cycle() {
            return Err(UpdateError::Busy { state });
        }
        if self.shutdown.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }

        let cancel = self.shutdown.child_token();
        *self.current_cycle.lock() = Some(cancel.clone());
        let result = self.run_cycle(&cancel).await;
        *self.current_cycle.lock() = None;
        result
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<UpdateState> {
        let now = self.clock.now_utc();
        self.status.transition(UpdateEvent::CheckStarted, "Checking for updates", |r| {
            r.last_check = Some(now);
        })?;
        let current = self.status.snapshot().current_version;

        let descriptor = match self.fetch_descriptor(&current, cancel).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                return self.status.transition(UpdateEvent::NoUpdate, "No update available", |_| {});
            }
            Err(e) => return self.abort(e, FailureKind::Metadata),
        };

        if descriptor.is_pre_release && !self.allow_prerelease {
            info!(version = %descriptor.version, "Ignoring pre-release update");
            return self.status.transition(
                UpdateEvent::NoUpdate,
                format!("Pre-release {} ignored", descriptor.version),
                |_| {},
            );
        }

        let below_floor = descriptor
            .minimum_version
            .as_ref()
            .is_some_and(|floor| &current < floor);
        if descriptor.version <= current && !below_floor {
            return self.status.transition(
                UpdateEvent::NoUpdate,
                format!("Agent {current} is up to date"),
                |r| r.latest_version = Some(descriptor.version.clone()),
            );
        }

        let required = descriptor.is_required_for(&current);
        info!(current = %current, available = %descriptor.version, required, "Update available");
        self.status.transition(
            UpdateEvent::UpdateFound,
            format!("Update {} available", descriptor.version),
            |r| {
                r.latest_version = Some(descriptor.version.clone());
                r.metadata.insert(META_REQUIRED.to_string(), required.to_string());
            },
        )?;

        if !self.policy.is_permitted(self.clock.now_local(), required) {
            info!(version = %descriptor.version, "Outside maintenance window, deferring install");
            self.status.update(|r| {
                r.status_message = format!(
                    "Update {} available; waiting for maintenance window",
                    descriptor.version
                );
            });
            return Ok(UpdateState::UpdateAvailable);
        }

        if let Err(e) = checkpoint(cancel) {
            return self.abort(e, FailureKind::Download);
        }
        self.install_update(&current, &descriptor, cancel).await
    }

    /// Download through rollback for an update the policy allowed
    async fn install_update(
        &self,
        current: &VersionIdentifier,
        descriptor: &UpdateArtifactDescriptor,
        cancel: &CancellationToken,
    ) -> Result<UpdateState> {
        let now = self.clock.now_utc();
        self.status.transition(
            UpdateEvent::DownloadStarted,
            format!("Downloading {}", descriptor.version),
            |r| {
                r.last_attempt = Some(now);
                r.total_bytes = descriptor.file_size;
            },
        )?;

        let artifact = self.download_dir.join(descriptor.artifact_file_name());
        let mut verified = None;
        if artifact.is_file() {
            if let Ok(report) = self.verifier.verify(&artifact, descriptor).await {
                info!(path = %artifact.display(), "Reusing previously downloaded artifact");
                verified = Some(report);
            }
        }

        let report = match verified {
            Some(report) => report,
            None => {
                if let Err(e) = self.download(descriptor, &artifact, cancel).await {
                    return self.abort(e, FailureKind::Download);
                }
                if let Err(e) = checkpoint(cancel) {
                    return self.abort(e, FailureKind::Download);
                }
                match self.verifier.verify(&artifact, descriptor).await {
                    Ok(report) => report,
                    Err(e) => return self.abort(e, FailureKind::Integrity),
                }
            }
        };
        self.status.transition(
            UpdateEvent::DownloadVerified,
            format!("Downloaded and verified {}", descriptor.version),
            |r| {
                r.metadata.insert(META_SHA256.to_string(), report.sha256.clone());
                r.metadata.insert(META_SIGNER.to_string(), report.signer.clone());
            },
        )?;

        if let Err(e) = checkpoint(cancel) {
            return self.abort(e, FailureKind::Backup);
        }
        self.status.transition(UpdateEvent::BackupStarted, "Backing up installation", |_| {})?;
        let backup = match self.snapshot(current).await {
            Ok(backup) => backup,
            Err(e) => return self.abort(e, FailureKind::Backup),
        };
        self.status.transition(
            UpdateEvent::BackupFinished,
            format!("Backup {} ready", backup.file_name),
            |r| {
                r.metadata.insert(META_BACKUP_FILE.to_string(), backup.file_name.clone());
            },
        )?;

        // Last point at which cancellation is honoured
        if let Err(e) = checkpoint(cancel) {
            return self.abort(e, FailureKind::Install);
        }

        self.status.transition(
            UpdateEvent::InstallStarted,
            format!("Installing {}", descriptor.version),
            |_| {},
        )?;
        let installed = match self.installer.install(&artifact).await {
            Ok(report) => report,
            Err(e) => return self.roll_back(Some(backup), e).await,
        };

        let now = self.clock.now_utc();
        let finish = |r: &mut UpdateStatusRecord| {
            r.current_version = descriptor.version.clone();
            r.last_success = Some(now);
            r.error_message = None;
            r.metadata.insert(META_EXIT_CODE.to_string(), installed.exit_code.to_string());
            r.metadata.insert(
                META_INSTALL_LOG.to_string(),
                installed.log_path.display().to_string(),
            );
        };

        let state = match installed.outcome {
            InstallOutcome::RebootRequired => {
                warn!(version = %descriptor.version, "Update installed, reboot required");
                // The installed files stay; the reboot finishes the update
                let restart_error = match self.service.start().await {
                    Ok(()) => None,
                    Err(e) => {
                        error!(error = %e, "Service did not restart after reboot-pending install");
                        Some(format!("service did not restart: {e}"))
                    }
                };
                self.status.transition(
                    UpdateEvent::RestartPending,
                    format!("Installed {}; restart required", descriptor.version),
                    |r| {
                        finish(r);
                        r.error_message = restart_error;
                    },
                )?
            }
            InstallOutcome::Success => {
                if let Err(e) = self.service.start().await {
                    let cause = UpdateError::install(format!("service did not restart: {e}"));
                    return self.roll_back(Some(backup), cause).await;
                }
                info!(version = %descriptor.version, "Update installed");
                self.status.transition(
                    UpdateEvent::InstallSucceeded,
                    format!("Installed {}", descriptor.version),
                    finish,
                )?
            }
        };

        discard_artifact(&artifact).await;
        Ok(state)
    }

    async fn fetch_descriptor(
        &self,
        current: &VersionIdentifier,
        cancel: &CancellationToken,
    ) -> Result<Option<UpdateArtifactDescriptor>> {
        let metadata = &self.metadata;
        let status = &self.status;
        self.retry
            .execute(
                cancel,
                move |_| async move {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(UpdateError::Cancelled),
                        result = metadata.latest(current) => result,
                    }
                },
                move |retry, error: &UpdateError, delay| {
                    record_retry(status, "Update check", retry, error, delay)
                },
            )
            .await
            .map_err(flatten_retry)
    }

    async fn download(
        &self,
        descriptor: &UpdateArtifactDescriptor,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let downloader = &self.downloader;
        let status = &self.status;
        let url = descriptor.download_url.as_str();
        let size = descriptor.file_size;

        self.retry
            .execute(
                cancel,
                move |_| async move {
                    let mut progress =
                        |done: u64, total: u64| status.record_download_progress(done, total);
                    downloader
                        .download(url, size, artifact, cancel, &mut progress)
                        .await
                },
                move |retry, error: &UpdateError, delay| {
                    record_retry(status, "Download", retry, error, delay)
                },
            )
            .await
            .map(|_| ())
            .map_err(flatten_retry)
    }

    /// Fresh backup, or a recent one of the same version when that fails
    async fn snapshot(&self, current: &VersionIdentifier) -> Result<BackupRecord> {
        match self.backups.create_backup(current).await {
            Ok(result) => Ok(result.record),
            Err(e) => match self.backups.reusable_backup(current, self.reuse_backup_within) {
                Some(record) => {
                    warn!(error = %e, backup = %record.file_name, "Backup failed, reusing recent backup");
                    Ok(record)
                }
                None => Err(e),
            },
        }
    }

    /// Restore `backup` after `cause` broke the installation.
    ///
    /// Must be called in `Installing` or `RollingBack`.
    async fn roll_back(&self, backup: Option<BackupRecord>, cause: UpdateError) -> Result<UpdateState> {
        let cause_message = cause.to_string();
        if self.status.state() == UpdateState::Installing {
            error!(error = %cause, "Installation failed, rolling back");
            self.status.transition(
                UpdateEvent::InstallFailed,
                format!("Installation failed; rolling back: {cause_message}"),
                |r| r.error_message = Some(cause_message.clone()),
            )?;
        }

        let restored = match backup {
            Some(record) => self.backups.restore_backup(&record).await,
            None => Err(UpdateError::restore("no backup available")),
        };

        // Never leave the service down, whatever the restore did
        let restarted = self.service.start().await;
        if let Err(e) = &restarted {
            error!(error = %e, "Service did not start after rollback");
        }

        match restored {
            Ok(result) => {
                info!(files = result.files_restored, "Rollback complete");
                self.status.transition(
                    UpdateEvent::RollbackSucceeded,
                    "Installation failed; previous version restored",
                    |r| {
                        r.metadata.insert(
                            META_FILES_RESTORED.to_string(),
                            result.files_restored.to_string(),
                        );
                        if let Err(e) = &restarted {
                            r.error_message = Some(format!("{cause_message}; {e}"));
                        }
                    },
                )
            }
            Err(e) => {
                error!(error = %e, "Rollback failed, manual intervention required");
                self.status.transition(
                    UpdateEvent::Fail(FailureKind::RollbackFailed),
                    "Rollback failed; manual intervention required",
                    |r| r.error_message = Some(format!("{cause_message}; {e}")),
                )
            }
        }
    }

    /// Reconcile a status record left behind by an interrupted process.
    ///
    /// Pre-install states return to `Idle`; an interrupted install or
    /// rollback is rolled back from the backup taken for it.
    pub async fn recover(&self) -> Result<UpdateState> {
        let _guard = self.in_flight.try_lock().map_err(|_| UpdateError::Busy {
            state: self.status.state(),
        })?;

        let state = self.status.state();
        if state.is_pre_install() {
            info!(state = %state, "Resetting interrupted update");
            return self.status.transition(
                UpdateEvent::Reset,
                format!("Recovered from interrupted update ({state})"),
                |_| {},
            );
        }
        if !state.defers_cancellation() {
            return Ok(state);
        }

        warn!(state = %state, "Installation was interrupted, restoring backup");
        let snapshot = self.status.snapshot();
        let backup = snapshot
            .metadata
            .get(META_BACKUP_FILE)
            .and_then(|name| {
                self.backups
                    .list_backups()
                    .into_iter()
                    .find(|record| &record.file_name == name)
            })
            .or_else(|| self.backups.latest_backup());

        self.roll_back(backup, UpdateError::install("installation was interrupted"))
            .await
    }

    /// Fail or cancel the current pre-install step
    fn abort(&self, error: UpdateError, kind: FailureKind) -> Result<UpdateState> {
        if matches!(error, UpdateError::Cancelled) {
            info!("Update cancelled");
            return self.status.transition(UpdateEvent::Cancel, "Update cancelled", |_| {});
        }

        error!(error = %error, kind = %kind, "Update attempt failed");
        let message = error.to_string();
        self.status.transition(
            UpdateEvent::Fail(kind),
            format!("Update failed: {message}"),
            |r| r.error_message = Some(message.clone()),
        )
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(UpdateError::Cancelled)
    } else {
        Ok(())
    }
}

fn flatten_retry(error: RetryError<UpdateError>) -> UpdateError {
    match error {
        RetryError::Fatal(e) => e,
        RetryError::Exhausted { attempts, last } => {
            warn!(attempts, error = %last, "Giving up after retries");
            last
        }
        RetryError::Cancelled => UpdateError::Cancelled,
    }
}

fn record_retry(status: &StatusStore, phase: &str, retry: u32, error: &UpdateError, delay: Duration) {
    status.update(|r| {
        r.retry_count = retry;
        r.error_message = Some(error.to_string());
        r.status_message = format!(
            "{phase} failed; retry {retry}/{} in {}s",
            r.max_retries,
            delay.as_secs()
        );
    });
}

async fn discard_artifact(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "Could not remove installed artifact");
    }
}
