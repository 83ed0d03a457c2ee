//! Installation snapshots and rollback
//!
//! Each backup is one `backup_<version>_<YYYYMMDD_HHMMSS>.tar.gz` archive in
//! the backup directory, listed in `manifest.json`. Restores always go
//! through `<backup_dir>/.staging` so a damaged archive never touches the
//! live installation.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

use crate::error::{Result, UpdateError};
use crate::policy::{Clock, SystemClock};
use crate::service::ServiceControl;
use crate::status::write_json_atomic;
use crate::version::VersionIdentifier;

const MANIFEST_FILE: &str = "manifest.json";
const STAGING_DIR: &str = ".staging";
const ARCHIVE_PREFIX: &str = "backup_";
const ARCHIVE_SUFFIX: &str = ".tar.gz";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// File extensions never worth snapshotting
const EXCLUDED_EXTENSIONS: &[&str] = &["tmp", "temp", "log", "cache", "pdb"];
/// Directory names never worth snapshotting
const EXCLUDED_DIRS: &[&str] = &["logs", "temp", "tmp", "cache"];

/// A snapshot of the installation directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Unique backup identifier
    pub id: Uuid,
    /// Archive file name inside the backup directory
    pub file_name: String,
    /// Installed version the snapshot captures
    pub version: VersionIdentifier,
    /// When the snapshot was taken
    pub created_at: DateTime<Utc>,
    /// Archive size in bytes
    pub size_bytes: u64,
    /// Files stored in the archive
    pub file_count: u64,
}

/// Outcome of [`BackupManager::create_backup`]
#[derive(Debug, Clone)]
pub struct BackupResult {
    pub record: BackupRecord,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub file_count: u64,
    /// Files that could not be read and were left out
    pub skipped_files: u64,
    pub elapsed: Duration,
}

/// Outcome of [`BackupManager::restore_backup`]
#[derive(Debug, Clone)]
pub struct RestoreResult {
    pub backup_id: Uuid,
    pub files_restored: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackupManifest {
    backups: Vec<BackupRecord>,
}

/// Creates, restores and prunes installation snapshots
pub struct BackupManager {
    backup_dir: PathBuf,
    install_dir: PathBuf,
    retention: chrono::Duration,
    max_backups: usize,
    service: Arc<dyn ServiceControl>,
    clock: Arc<dyn Clock>,
    manifest_lock: Mutex<()>,
}

impl BackupManager {
    /// Create a backup manager with 30-day retention and at most 5 archives
    pub fn new(
        backup_dir: impl Into<PathBuf>,
        install_dir: impl Into<PathBuf>,
        service: Arc<dyn ServiceControl>,
    ) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            install_dir: install_dir.into(),
            retention: chrono::Duration::days(30),
            max_backups: 5,
            service,
            clock: Arc::new(SystemClock),
            manifest_lock: Mutex::new(()),
        }
    }

    /// Archives older than this many days are swept
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention = chrono::Duration::days(i64::from(days));
        self
    }

    /// Keep at most this many archives (0 = no cap)
    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups;
        self
    }

    /// Use another time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Location of a record's archive
    pub fn archive_path(&self, record: &BackupRecord) -> PathBuf {
        self.backup_dir.join(&record.file_name)
    }

    fn staging_dir(&self) -> PathBuf {
        self.backup_dir.join(STAGING_DIR)
    }

    /// Snapshot the installation directory as `version`
    pub async fn create_backup(&self, version: &VersionIdentifier) -> Result<BackupResult> {
        let started = Instant::now();
        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| UpdateError::backup(format!("cannot create backup directory: {e}")))?;

        if let Err(e) = self.sweep_expired() {
            warn!(error = %e, "Backup retention sweep failed");
        }

        if !self.install_dir.is_dir() {
            return Err(UpdateError::backup(format!(
                "installation directory {} does not exist",
                self.install_dir.display()
            )));
        }

        let created_at = self.clock.now_utc();
        let archive_path = self.unique_archive_path(version, created_at);
        info!(version = %version, path = %archive_path.display(), "Creating backup");

        let install_dir = self.install_dir.clone();
        let backup_dir = self.backup_dir.clone();
        let target = archive_path.clone();
        let written = tokio::task::spawn_blocking(move || {
            write_archive(&install_dir, &backup_dir, &target)
        })
        .await
        .map_err(|e| UpdateError::backup(format!("backup task failed: {e}")))?;

        let stats = match written {
            Ok(stats) => stats,
            Err(e) => {
                remove_file_if_exists(&archive_path);
                return Err(UpdateError::backup(format!(
                    "cannot write {}: {e}",
                    archive_path.display()
                )));
            }
        };

        let size_bytes = fs::metadata(&archive_path).map(|m| m.len()).unwrap_or(0);
        let record = BackupRecord {
            id: Uuid::new_v4(),
            file_name: file_name_of(&archive_path),
            version: version.clone(),
            created_at,
            size_bytes,
            file_count: stats.files,
        };

        {
            let _guard = self.manifest_lock.lock();
            let mut manifest = self.load_manifest();
            manifest.backups.push(record.clone());
            if let Err(e) = self.save_manifest(&manifest) {
                remove_file_if_exists(&archive_path);
                return Err(UpdateError::backup(format!("cannot update backup manifest: {e}")));
            }
        }
        if let Err(e) = self.enforce_cap() {
            warn!(error = %e, "Failed to prune surplus backups");
        }

        let elapsed = started.elapsed();
        info!(
            version = %version,
            files = stats.files,
            skipped = stats.skipped,
            size_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Backup created"
        );

        Ok(BackupResult {
            path: archive_path,
            size_bytes,
            file_count: stats.files,
            skipped_files: stats.skipped,
            elapsed,
            record,
        })
    }

    /// Restore the installation from `record`.
    ///
    /// The archive is unpacked into the staging directory, the hosting
    /// service is stopped and the staged files are copied over the
    /// installation. Staging is removed on every path.
    pub async fn restore_backup(&self, record: &BackupRecord) -> Result<RestoreResult> {
        let started = Instant::now();
        let archive = self.archive_path(record);
        let staging = self.staging_dir();
        info!(version = %record.version, path = %archive.display(), "Restoring backup");

        let result = self.restore_via_staging(&archive, &staging).await;

        let cleanup = staging.clone();
        let cleaned = tokio::task::spawn_blocking(move || remove_dir_if_exists(&cleanup)).await;
        match cleaned {
            Ok(Ok(())) => debug!(path = %staging.display(), "Removed staging directory"),
            Ok(Err(e)) => error!(path = %staging.display(), error = %e, "Failed to remove staging directory"),
            Err(e) => error!(error = %e, "Staging cleanup task failed"),
        }

        let files_restored = result?;
        let elapsed = started.elapsed();
        info!(
            version = %record.version,
            files = files_restored,
            elapsed_ms = elapsed.as_millis() as u64,
            "Backup restored"
        );

        Ok(RestoreResult {
            backup_id: record.id,
            files_restored,
            elapsed,
        })
    }

    async fn restore_via_staging(&self, archive: &Path, staging: &Path) -> Result<u64> {
        if !archive.is_file() {
            return Err(UpdateError::restore(format!(
                "backup archive {} is missing",
                archive.display()
            )));
        }

        let source = archive.to_path_buf();
        let target = staging.to_path_buf();
        tokio::task::spawn_blocking(move || extract_archive(&source, &target))
            .await
            .map_err(|e| UpdateError::restore(format!("extract task failed: {e}")))?
            .map_err(|e| UpdateError::restore(format!("cannot extract {}: {e}", archive.display())))?;

        if let Err(e) = self.service.stop().await {
            warn!(service = self.service.name(), error = %e, "Could not stop service before restore, continuing");
        }

        let source = staging.to_path_buf();
        let target = self.install_dir.clone();
        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| UpdateError::restore(format!("copy task failed: {e}")))?
            .map_err(|e| UpdateError::restore(format!("cannot copy staged files: {e}")))
    }

    /// All backups, newest first
    pub fn list_backups(&self) -> Vec<BackupRecord> {
        let _guard = self.manifest_lock.lock();
        let mut backups = self.load_manifest().backups;
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        backups
    }

    /// Newest backup, if any
    pub fn latest_backup(&self) -> Option<BackupRecord> {
        self.list_backups().into_iter().next()
    }

    /// Newest backup of `version` taken within `max_age`, if its archive is
    /// still on disk
    pub fn reusable_backup(
        &self,
        version: &VersionIdentifier,
        max_age: chrono::Duration,
    ) -> Option<BackupRecord> {
        let cutoff = self.clock.now_utc() - max_age;
        self.list_backups().into_iter().find(|record| {
            &record.version == version
                && record.created_at >= cutoff
                && self.archive_path(record).is_file()
        })
    }

    /// Delete expired archives and those beyond the count cap; returns what
    /// was removed.
    pub fn sweep_retention(&self) -> Result<Vec<BackupRecord>> {
        let mut removed = self.sweep_expired()?;
        removed.extend(self.enforce_cap()?);
        Ok(removed)
    }

    fn sweep_expired(&self) -> Result<Vec<BackupRecord>> {
        let cutoff = self.clock.now_utc() - self.retention;
        self.prune(|_, record| record.created_at < cutoff)
    }

    fn enforce_cap(&self) -> Result<Vec<BackupRecord>> {
        if self.max_backups == 0 {
            return Ok(Vec::new());
        }
        let max = self.max_backups;
        self.prune(|rank, _| rank >= max)
    }

    /// Remove records matching `doomed(rank, record)`, rank 0 being newest
    fn prune(&self, doomed: impl Fn(usize, &BackupRecord) -> bool) -> Result<Vec<BackupRecord>> {
        let _guard = self.manifest_lock.lock();
        let mut manifest = self.load_manifest();
        manifest.backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let (mut kept, mut removed) = (Vec::new(), Vec::new());
        for (rank, record) in manifest.backups.into_iter().enumerate() {
            if doomed(rank, &record) {
                removed.push(record);
            } else {
                kept.push(record);
            }
        }
        if removed.is_empty() {
            return Ok(removed);
        }

        for record in &removed {
            let path = self.archive_path(record);
            match fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), created_at = %record.created_at, "Removed old backup"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove old backup"),
            }
        }

        self.save_manifest(&BackupManifest { backups: kept })?;
        Ok(removed)
    }

    /// Manifest on disk; rebuilt from archive names when missing or corrupt
    fn load_manifest(&self) -> BackupManifest {
        let path = self.backup_dir.join(MANIFEST_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<BackupManifest>(&content) {
                Ok(manifest) => return manifest,
                Err(e) => warn!(path = %path.display(), error = %e, "Backup manifest corrupt, rebuilding"),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot read backup manifest, rebuilding"),
        }
        self.scan_archives()
    }

    fn scan_archives(&self) -> BackupManifest {
        let Ok(entries) = fs::read_dir(&self.backup_dir) else {
            return BackupManifest::default();
        };

        let backups = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let (version, created_at) = parse_archive_name(&name)?;
                let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
                Some(BackupRecord {
                    id: Uuid::new_v4(),
                    file_name: name,
                    version,
                    created_at,
                    size_bytes,
                    file_count: 0,
                })
            })
            .collect();
        BackupManifest { backups }
    }

    fn save_manifest(&self, manifest: &BackupManifest) -> Result<()> {
        write_json_atomic(&self.backup_dir.join(MANIFEST_FILE), manifest)
    }

    fn unique_archive_path(&self, version: &VersionIdentifier, at: DateTime<Utc>) -> PathBuf {
        let stem = format!("{ARCHIVE_PREFIX}{version}_{}", at.format(TIMESTAMP_FORMAT));
        let mut path = self.backup_dir.join(format!("{stem}{ARCHIVE_SUFFIX}"));
        let mut n = 1;
        while path.exists() {
            path = self.backup_dir.join(format!("{stem}-{n}{ARCHIVE_SUFFIX}"));
            n += 1;
        }
        path
    }
}

struct ArchiveStats {
    files: u64,
    skipped: u64,
}

fn write_archive(install_dir: &Path, backup_dir: &Path, target: &Path) -> io::Result<ArchiveStats> {
    let file = File::create(target)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut stats = ArchiveStats { files: 0, skipped: 0 };

    let walker = WalkDir::new(install_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_excluded_dir(entry, backup_dir));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                stats.skipped += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() || is_excluded_file(entry.path()) {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(install_dir) else {
            continue;
        };
        let mut source = match File::open(entry.path()) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping unreadable file");
                stats.skipped += 1;
                continue;
            }
        };
        builder.append_file(relative, &mut source)?;
        stats.files += 1;
    }

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(stats)
}

fn extract_archive(archive: &Path, staging: &Path) -> io::Result<()> {
    remove_dir_if_exists(staging)?;
    fs::create_dir_all(staging)?;
    let decoder = GzDecoder::new(File::open(archive)?);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.unpack(staging)
}

fn copy_tree(source: &Path, target: &Path) -> io::Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let destination = target.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &destination)?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn is_excluded_dir(entry: &DirEntry, backup_dir: &Path) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    if entry.path() == backup_dir {
        return true;
    }
    let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
    EXCLUDED_DIRS.contains(&name.as_str())
}

fn is_excluded_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| EXCLUDED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Version and timestamp from `backup_<version>_<YYYYMMDD_HHMMSS>[-N].tar.gz`,
/// where `-N` separates archives taken within the same second
fn parse_archive_name(name: &str) -> Option<(VersionIdentifier, DateTime<Utc>)> {
    let stem = name.strip_prefix(ARCHIVE_PREFIX)?.strip_suffix(ARCHIVE_SUFFIX)?;
    let mut parts = stem.rsplitn(3, '_');
    let tail = parts.next()?;
    let time = match tail.split_once('-') {
        Some((time, n)) => {
            n.parse::<u32>().ok()?;
            time
        }
        None => tail,
    };
    let date = parts.next()?;
    let version = parts.next()?;

    let created_at = NaiveDateTime::parse_from_str(&format!("{date}_{time}"), TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    let version = VersionIdentifier::parse(version).ok()?;
    Some((version, created_at))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn remove_file_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial archive");
        }
    }
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::FixedClock;
    use crate::service::NoopServiceControl;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    struct Dirs {
        _root: TempDir,
        install: PathBuf,
        backups: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = TempDir::new().unwrap();
        let install = root.path().join("install");
        let backups = root.path().join("backups");
        fs::create_dir_all(install.join("bin")).unwrap();
        fs::create_dir_all(install.join("logs")).unwrap();
        fs::write(install.join("bin/agent.exe"), b"binary v5").unwrap();
        fs::write(install.join("appsettings.json"), b"{}").unwrap();
        fs::write(install.join("agent.pdb"), b"symbols").unwrap();
        fs::write(install.join("session.TMP"), b"scratch").unwrap();
        fs::write(install.join("logs/agent.txt"), b"log line").unwrap();
        Dirs {
            _root: root,
            install,
            backups,
        }
    }

    fn clock_at(day: u32) -> Arc<dyn Clock> {
        let at = NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(3, 0, 0)
            .unwrap();
        Arc::new(FixedClock::at(at))
    }

    fn manager(d: &Dirs, day: u32) -> BackupManager {
        BackupManager::new(&d.backups, &d.install, Arc::new(NoopServiceControl))
            .with_clock(clock_at(day))
    }

    fn v5() -> VersionIdentifier {
        VersionIdentifier::new(5, 0, 0)
    }

    #[tokio::test]
    async fn test_create_backup_skips_transient_files() {
        let d = dirs();
        let result = manager(&d, 16).create_backup(&v5()).await.unwrap();

        assert_eq!(result.file_count, 2);
        assert_eq!(result.skipped_files, 0);
        assert!(result.path.is_file());
        assert_eq!(
            file_name_of(&result.path),
            "backup_5.0.0_20261016_030000.tar.gz"
        );
        assert_eq!(result.record.size_bytes, fs::metadata(&result.path).unwrap().len());
    }

    #[tokio::test]
    async fn test_restore_overwrites_installation() {
        let d = dirs();
        let manager = manager(&d, 16);
        let backup = manager.create_backup(&v5()).await.unwrap();

        fs::write(d.install.join("bin/agent.exe"), b"broken v6").unwrap();
        fs::remove_file(d.install.join("appsettings.json")).unwrap();

        let restored = manager.restore_backup(&backup.record).await.unwrap();
        assert_eq!(restored.files_restored, 2);
        assert_eq!(fs::read(d.install.join("bin/agent.exe")).unwrap(), b"binary v5");
        assert!(d.install.join("appsettings.json").is_file());
        assert!(!d.backups.join(STAGING_DIR).exists());
    }

    #[tokio::test]
    async fn test_corrupted_archive_leaves_installation_and_no_staging() {
        let d = dirs();
        let manager = manager(&d, 16);
        let backup = manager.create_backup(&v5()).await.unwrap();
        fs::write(&backup.path, b"definitely not gzip").unwrap();
        fs::write(d.install.join("bin/agent.exe"), b"current").unwrap();

        let err = manager.restore_backup(&backup.record).await.unwrap_err();
        assert!(matches!(err, UpdateError::Restore { .. }));
        assert_eq!(fs::read(d.install.join("bin/agent.exe")).unwrap(), b"current");
        assert!(!d.backups.join(STAGING_DIR).exists());
    }

    #[tokio::test]
    async fn test_missing_install_dir_fails() {
        let d = dirs();
        fs::remove_dir_all(&d.install).unwrap();
        let err = manager(&d, 16).create_backup(&v5()).await.unwrap_err();
        assert!(matches!(err, UpdateError::Backup { .. }));
    }

    #[tokio::test]
    async fn test_retention_sweeps_old_archives() {
        let d = dirs();
        let old = manager(&d, 1)
            .with_retention_days(7)
            .create_backup(&v5())
            .await
            .unwrap();

        let current = manager(&d, 16).with_retention_days(7);
        let removed = current.sweep_retention().unwrap();

        assert_eq!(removed.len(), 1);
        assert!(!old.path.exists());
        assert!(current.list_backups().is_empty());
    }

    #[tokio::test]
    async fn test_count_cap_keeps_newest() {
        let d = dirs();
        for day in [10, 11, 12] {
            manager(&d, day).with_max_backups(2).create_backup(&v5()).await.unwrap();
        }

        let backups = manager(&d, 12).list_backups();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].created_at.format("%d").to_string(), "12");
        assert_eq!(backups[1].created_at.format("%d").to_string(), "11");
    }

    #[tokio::test]
    async fn test_reusable_backup_respects_version_and_age() {
        let d = dirs();
        manager(&d, 15).create_backup(&v5()).await.unwrap();

        let m = manager(&d, 16);
        assert!(m.reusable_backup(&v5(), chrono::Duration::hours(48)).is_some());
        assert!(m.reusable_backup(&v5(), chrono::Duration::hours(12)).is_none());
        assert!(m
            .reusable_backup(&VersionIdentifier::new(4, 9, 0), chrono::Duration::hours(48))
            .is_none());
    }

    #[tokio::test]
    async fn test_manifest_rebuilt_from_archive_names() {
        let d = dirs();
        let m = manager(&d, 16);
        let backup = m.create_backup(&VersionIdentifier::parse("5.0.0-rc.1").unwrap()).await.unwrap();
        fs::write(d.backups.join(MANIFEST_FILE), b"{not json").unwrap();

        let latest = m.latest_backup().unwrap();
        assert_eq!(latest.file_name, backup.record.file_name);
        assert_eq!(latest.version.to_string(), "5.0.0-rc.1");
        assert_eq!(latest.created_at, backup.record.created_at);
    }

    #[test]
    fn test_parse_archive_name_rejects_foreign_files() {
        assert!(parse_archive_name("manifest.json").is_none());
        assert!(parse_archive_name("backup_5.0.0.tar.gz").is_none());
        assert!(parse_archive_name("backup_x.y.z_20261016_030000.tar.gz").is_none());
        assert!(parse_archive_name("backup_5.0.0_20261016_030000-x.tar.gz").is_none());
    }

    #[tokio::test]
    async fn test_same_second_archives_survive_manifest_rebuild() {
        let d = dirs();
        let m = manager(&d, 16);
        let first = m.create_backup(&v5()).await.unwrap();
        let second = m.create_backup(&v5()).await.unwrap();
        assert_ne!(first.record.file_name, second.record.file_name);
        assert!(second.record.file_name.ends_with("-1.tar.gz"));

        fs::remove_file(d.backups.join(MANIFEST_FILE)).unwrap();

        let mut names: Vec<String> = m.list_backups().into_iter().map(|b| b.file_name).collect();
        names.sort();
        let mut expected = vec![first.record.file_name, second.record.file_name];
        expected.sort();
        assert_eq!(names, expected);
        assert!(m.list_backups().iter().all(|b| b.created_at == first.record.created_at));
    }
}
