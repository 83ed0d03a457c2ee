//! Persisted update status record
//!
//! The record is replaced whole on every transition while the write lock is
//! held, then written to disk via temp file + rename. Readers either call
//! [`StatusStore::snapshot`] in-process or [`StatusStore::read_snapshot`] on
//! the file; neither can observe a half-applied transition.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::state::{UpdateEvent, UpdateState};
use crate::version::VersionIdentifier;

/// Download phase occupies this span of the overall percentage
const DOWNLOAD_PROGRESS_START: u8 = 10;
const DOWNLOAD_PROGRESS_END: u8 = 60;

/// Snapshot of the update engine's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusRecord {
    /// Lifecycle state
    pub state: UpdateState,
    /// Human-readable description of the current step
    pub status_message: String,
    /// Installed agent version
    pub current_version: VersionIdentifier,
    /// Newest version reported by the server
    pub latest_version: Option<VersionIdentifier>,
    /// Last metadata check
    pub last_check: Option<DateTime<Utc>>,
    /// Last time a download/install was attempted
    pub last_attempt: Option<DateTime<Utc>>,
    /// Last successful install
    pub last_success: Option<DateTime<Utc>>,
    /// Overall progress 0-100
    pub progress_percentage: u8,
    /// Artifact size, while downloading
    pub total_bytes: u64,
    /// Bytes on disk, while downloading
    pub downloaded_bytes: u64,
    /// Retries used in the current cycle
    pub retry_count: u32,
    /// Retry ceiling
    pub max_retries: u32,
    /// Error of the last failed step
    pub error_message: Option<String>,
    /// Free-form details (backup path, installer exit code, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Identifier of the current cycle
    #[serde(default)]
    pub operation_id: Option<Uuid>,
    /// When the record last changed
    pub updated_at: DateTime<Utc>,
}

impl UpdateStatusRecord {
    /// Fresh record for an agent at `current_version`
    pub fn new(current_version: VersionIdentifier, max_retries: u32) -> Self {
        Self {
            state: UpdateState::Idle,
            status_message: "Idle".to_string(),
            current_version,
            latest_version: None,
            last_check: None,
            last_attempt: None,
            last_success: None,
            progress_percentage: 0,
            total_bytes: 0,
            downloaded_bytes: 0,
            retry_count: 0,
            max_retries,
            error_message: None,
            metadata: BTreeMap::new(),
            operation_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// Owner of the status record and its on-disk copy
#[derive(Debug)]
pub struct StatusStore {
    path: Option<PathBuf>,
    record: RwLock<UpdateStatusRecord>,
}

impl StatusStore {
    /// Load the persisted record or start a fresh one.
    ///
    /// A record for a different installed version is kept for its history
    /// but adopts `current_version`; an unreadable file is replaced.
    pub fn load_or_create(
        path: impl Into<PathBuf>,
        current_version: VersionIdentifier,
        max_retries: u32,
    ) -> Result<Self> {
        let path = path.into();
        let record = match Self::read_snapshot(&path) {
            Ok(mut record) => {
                if record.current_version != current_version {
                    debug!(
                        persisted = %record.current_version,
                        running = %current_version,
                        "Installed version differs from status record"
                    );
                    record.current_version = current_version;
                }
                record.max_retries = max_retries;
                record
            }
            Err(e) => {
                if path.exists() {
                    warn!(path = %path.display(), error = %e, "Discarding unreadable status file");
                }
                UpdateStatusRecord::new(current_version, max_retries)
            }
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_json_atomic(&path, &record)?;

        Ok(Self {
            path: Some(path),
            record: RwLock::new(record),
        })
    }

    /// Store without persistence
    pub fn in_memory(record: UpdateStatusRecord) -> Self {
        Self {
            path: None,
            record: RwLock::new(record),
        }
    }

    /// Read a persisted record without involving a running orchestrator
    pub fn read_snapshot(path: &Path) -> Result<UpdateStatusRecord> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Location of the status file
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Consistent copy of the current record
    pub fn snapshot(&self) -> UpdateStatusRecord {
        self.record.read().clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> UpdateState {
        self.record.read().state
    }

    /// Apply a state machine event and rewrite the record in one step.
    ///
    /// `mutate` runs on the new record after the generic fields (state,
    /// message, progress, byte counters, timestamp) have been set.
    pub fn transition(
        &self,
        event: UpdateEvent,
        message: impl Into<String>,
        mutate: impl FnOnce(&mut UpdateStatusRecord),
    ) -> Result<UpdateState> {
        let mut guard = self.record.write();
        let next = guard.state.apply(event)?;

        let mut record = guard.clone();
        record.state = next;
        record.status_message = message.into();
        record.progress_percentage = next.progress_baseline();
        record.updated_at = Utc::now();
        if !next.tracks_download() {
            record.total_bytes = 0;
            record.downloaded_bytes = 0;
        }
        if event == UpdateEvent::CheckStarted {
            record.retry_count = 0;
            record.error_message = None;
            record.metadata.clear();
            record.operation_id = Some(Uuid::new_v4());
        }
        mutate(&mut record);

        debug!(from = %guard.state, to = %next, message = %record.status_message, "Update state transition");
        self.persist(&record);
        *guard = record;
        Ok(next)
    }

    /// Change fields without a state change
    pub fn update(&self, mutate: impl FnOnce(&mut UpdateStatusRecord)) {
        let mut guard = self.record.write();
        let mut record = guard.clone();
        mutate(&mut record);
        record.updated_at = Utc::now();
        self.persist(&record);
        *guard = record;
    }

    /// Record download progress; persisted when the percentage moves
    pub fn record_download_progress(&self, downloaded: u64, total: u64) {
        let mut guard = self.record.write();
        if !guard.state.tracks_download() {
            return;
        }

        let span = u64::from(DOWNLOAD_PROGRESS_END - DOWNLOAD_PROGRESS_START);
        let percentage = if total > 0 {
            DOWNLOAD_PROGRESS_START + (downloaded.min(total) * span / total) as u8
        } else {
            DOWNLOAD_PROGRESS_START
        };
        let changed = percentage != guard.progress_percentage;

        guard.downloaded_bytes = downloaded;
        guard.total_bytes = total;
        guard.progress_percentage = percentage;
        guard.updated_at = Utc::now();

        if changed {
            self.persist(&guard);
        }
    }

    fn persist(&self, record: &UpdateStatusRecord) {
        if let Some(path) = &self.path {
            if let Err(e) = write_json_atomic(path, record) {
                error!(path = %path.display(), error = %e, "Failed to persist update status");
            }
        }
    }
}

/// Write JSON next to `path` and rename it into place
pub(crate) fn write_json_atomic(path: &Path, value: &impl Serialize) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, value)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
