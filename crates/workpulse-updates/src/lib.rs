//! Self-update engine for the WorkPulse agent
//!
//! Checks the update API, downloads and verifies new agent builds, snapshots
//! the installation, runs the installer and rolls back when it fails.
//!
//! ## Components
//!
//! - [`version`]: version parsing and ordering
//! - [`integrity`]: checksum and publisher signature verification
//! - [`downloader`]: resumable artifact download
//! - [`backup`]: installation snapshots, restore and retention
//! - [`installer`]: unattended installer invocation
//! - [`policy`]: maintenance windows
//! - [`orchestrator`]: the update state machine tying it together

pub mod backup;
pub mod downloader;
pub mod error;
pub mod installer;
pub mod integrity;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod policy;
pub mod service;
pub mod settings;
pub mod state;
pub mod status;
pub mod version;

pub use backup::{BackupManager, BackupRecord, BackupResult, RestoreResult};
pub use downloader::{ArtifactDownloader, DownloadOutcome};
pub use error::{Result, UpdateError};
pub use installer::{InstallOutcome, InstallReport, InstallationExecutor, Installer, InstallerCommand};
pub use integrity::{IntegrityVerifier, TrustStore, VerificationReport};
pub use metadata::{HttpMetadataSource, MetadataSource};
pub use models::{
    ChecksumAlgorithm, KeyUsage, PublisherCertificate, SignatureAlgorithm, UpdateArtifactDescriptor,
};
pub use orchestrator::{OrchestratorOptions, OrchestratorParts, UpdateOrchestrator};
pub use policy::{
    Clock, FixedClock, MaintenanceWindow, MaintenanceWindowPolicy, MaintenanceWindowSpec,
    SystemClock,
};
pub use service::{NoopServiceControl, ServiceControl, SystemServiceControl};
pub use settings::{UpdatePaths, UpdateSettings};
pub use state::{FailureKind, UpdateEvent, UpdateState};
pub use status::{StatusStore, UpdateStatusRecord};
pub use version::{compare, VersionIdentifier};
