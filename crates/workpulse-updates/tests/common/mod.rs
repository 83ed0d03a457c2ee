//! Shared fixtures for orchestrator scenario tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use workpulse_http::{HttpClient, HttpConfig, RetryConfig};
use workpulse_updates::{
    ArtifactDownloader, BackupManager, FixedClock, HttpMetadataSource, InstallOutcome,
    InstallReport, Installer, IntegrityVerifier, KeyUsage, MaintenanceWindow,
    MaintenanceWindowPolicy, MaintenanceWindowSpec, OrchestratorOptions, OrchestratorParts,
    PublisherCertificate, Result, ServiceControl, StatusStore, TrustStore, UpdateError,
    UpdateOrchestrator, VersionIdentifier,
};

pub const ARTIFACT: &[u8] = b"WorkPulse agent 5.1.0 installer payload";
pub const ARTIFACT_PATH: &str = "/files/WorkPulseAgent-5.1.0.msi";

/// Monday afternoon, outside the Saturday night window
pub fn weekday_afternoon() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 10, 12)
        .unwrap()
        .and_hms_opt(14, 0, 0)
        .unwrap()
}

/// Saturday 02:00, inside the window
pub fn saturday_night() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 10, 17)
        .unwrap()
        .and_hms_opt(2, 0, 0)
        .unwrap()
}

pub fn saturday_window() -> MaintenanceWindowSpec {
    MaintenanceWindowSpec {
        windows: vec![MaintenanceWindow::new(
            vec![Weekday::Sat],
            chrono::NaiveTime::from_hms_opt(1, 0, 0).unwrap(),
            chrono::NaiveTime::from_hms_opt(5, 0, 0).unwrap(),
        )],
    }
}

/// Root CA and release signing key
pub struct Publisher {
    pub root: PublisherCertificate,
    pub leaf: PublisherCertificate,
    leaf_key: SigningKey,
}

impl Publisher {
    pub fn new() -> Self {
        let root_key = SigningKey::from_bytes(&[1u8; 32]);
        let leaf_key = SigningKey::from_bytes(&[2u8; 32]);
        let root = certificate(
            "WorkPulse Root",
            "WorkPulse Root",
            &root_key,
            KeyUsage::CertificateSigning,
            &root_key,
        );
        let leaf = certificate(
            "WorkPulse Release Signing",
            "WorkPulse Root",
            &leaf_key,
            KeyUsage::CodeSigning,
            &root_key,
        );
        Self {
            root,
            leaf,
            leaf_key,
        }
    }

    pub fn sign(&self, content: &[u8]) -> String {
        let digest: [u8; 32] = Sha256::digest(content).into();
        BASE64.encode(self.leaf_key.sign(&digest).to_bytes())
    }
}

fn certificate(
    subject: &str,
    issuer: &str,
    key: &SigningKey,
    usage: KeyUsage,
    signer: &SigningKey,
) -> PublisherCertificate {
    let mut cert = PublisherCertificate {
        subject: subject.to_string(),
        issuer: issuer.to_string(),
        public_key: BASE64.encode(key.verifying_key().to_bytes()),
        not_before: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        not_after: Utc.with_ymd_and_hms(2027, 12, 31, 0, 0, 0).unwrap(),
        key_usage: vec![usage],
        signature: None,
    };
    cert.signature = Some(BASE64.encode(signer.sign(&cert.to_be_signed()).to_bytes()));
    cert
}

/// Descriptor JSON served by the mock update API
pub fn descriptor_json(server: &MockServer, publisher: &Publisher) -> serde_json::Value {
    serde_json::json!({
        "version": "5.1.0",
        "downloadUrl": format!("{}{}", server.uri(), ARTIFACT_PATH),
        "fileSize": ARTIFACT.len(),
        "checksum": hex::encode(Sha256::digest(ARTIFACT)),
        "checksumAlgorithm": "SHA256",
        "signature": publisher.sign(ARTIFACT),
        "signatureAlgorithm": "Ed25519",
        "signingCertificate": publisher.leaf,
        "releaseDate": "2026-10-01T00:00:00Z",
        "releaseNotes": "Bug fixes",
        "isRequired": false,
        "isPreRelease": false
    })
}

pub async fn mount_descriptor(server: &MockServer, descriptor: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/updates/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(descriptor))
        .mount(server)
        .await;
}

pub async fn mount_artifact(server: &MockServer, expected_calls: u64) {
    Mock::given(method("GET"))
        .and(path(ARTIFACT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ARTIFACT))
        .expect(expected_calls)
        .mount(server)
        .await;
}

/// What the fake installer does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallBehaviour {
    Succeed,
    RebootPending,
    Fail,
    /// Damage every backup archive, then fail
    FailAndCorruptBackups,
}

/// Installer that overwrites the agent binary and reports a scripted outcome
pub struct FakeInstaller {
    pub behaviour: InstallBehaviour,
    pub install_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub calls: AtomicUsize,
    pub backups_seen: AtomicUsize,
    /// Stopped before the binary is replaced, like the real executor does
    pub service: Option<Arc<RecordingService>>,
}

impl FakeInstaller {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn archives_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.to_string_lossy().ends_with(".tar.gz"))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn install(&self, artifact: &Path) -> Result<InstallReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(artifact.is_file(), "installer must receive the verified artifact");
        self.backups_seen
            .store(archives_in(&self.backup_dir).len(), Ordering::SeqCst);
        if let Some(service) = &self.service {
            service.stop().await?;
        }

        std::fs::write(self.install_dir.join("bin/agent.exe"), b"agent v5.1.0").unwrap();

        let outcome = match self.behaviour {
            InstallBehaviour::Succeed => InstallOutcome::Success,
            InstallBehaviour::RebootPending => InstallOutcome::RebootRequired,
            InstallBehaviour::Fail => {
                return Err(UpdateError::install("installer exited with code 1603"))
            }
            InstallBehaviour::FailAndCorruptBackups => {
                for archive in archives_in(&self.backup_dir) {
                    std::fs::write(archive, b"garbage").unwrap();
                }
                return Err(UpdateError::install("installer exited with code 1603"));
            }
        };
        Ok(InstallReport {
            outcome,
            exit_code: if outcome == InstallOutcome::Success { 0 } else { 3010 },
            log_path: self.install_dir.join("install.log"),
            duration: Duration::from_millis(5),
        })
    }
}

/// Records stop/start calls
#[derive(Default)]
pub struct RecordingService {
    pub events: Mutex<Vec<&'static str>>,
    pub fail_start: bool,
}

impl RecordingService {
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl ServiceControl for RecordingService {
    fn name(&self) -> &str {
        "WorkPulseAgent"
    }

    async fn stop(&self) -> Result<()> {
        self.events.lock().push("stop");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.events.lock().push("start");
        if self.fail_start {
            return Err(UpdateError::service("start WorkPulseAgent exited with 1"));
        }
        Ok(())
    }
}

/// Everything a scenario needs
pub struct Harness {
    pub root: TempDir,
    pub install_dir: PathBuf,
    pub data_dir: PathBuf,
    pub orchestrator: Arc<UpdateOrchestrator>,
    pub installer: Arc<FakeInstaller>,
    pub service: Arc<RecordingService>,
    pub status: Arc<StatusStore>,
}

pub struct HarnessOptions {
    pub now: NaiveDateTime,
    pub window: MaintenanceWindowSpec,
    pub behaviour: InstallBehaviour,
    pub fail_start: bool,
    pub allow_prerelease: bool,
    pub create_install_dir: bool,
    pub max_retries: u32,
    pub installer_stops_service: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            now: saturday_night(),
            window: saturday_window(),
            behaviour: InstallBehaviour::Succeed,
            fail_start: false,
            allow_prerelease: false,
            create_install_dir: true,
            max_retries: 2,
            installer_stops_service: false,
        }
    }
}

impl Harness {
    pub fn new(server: &MockServer, publisher: &Publisher, options: HarnessOptions) -> Self {
        let root = TempDir::new().unwrap();
        let install_dir = root.path().join("install");
        let data_dir = root.path().join("data");
        let backup_dir = data_dir.join("backups");

        if options.create_install_dir {
            std::fs::create_dir_all(install_dir.join("bin")).unwrap();
            std::fs::write(install_dir.join("bin/agent.exe"), b"agent v5.0.0").unwrap();
            std::fs::write(install_dir.join("appsettings.json"), b"{\"server\":\"x\"}").unwrap();
        }

        let clock = Arc::new(FixedClock::at(options.now));
        let service = Arc::new(RecordingService {
            events: Mutex::new(Vec::new()),
            fail_start: options.fail_start,
        });
        let installer = Arc::new(FakeInstaller {
            behaviour: options.behaviour,
            install_dir: install_dir.clone(),
            backup_dir: backup_dir.clone(),
            calls: AtomicUsize::new(0),
            backups_seen: AtomicUsize::new(0),
            service: options.installer_stops_service.then(|| service.clone()),
        });
        let status = Arc::new(
            StatusStore::load_or_create(
                data_dir.join("status.json"),
                VersionIdentifier::new(5, 0, 0),
                options.max_retries,
            )
            .unwrap(),
        );

        let http = Arc::new(HttpClient::new(HttpConfig::default()).unwrap());
        let parts = OrchestratorParts {
            metadata: Arc::new(
                HttpMetadataSource::new(http.clone(), &server.uri())
                    .unwrap()
                    .with_platform("windows", "x64"),
            ),
            downloader: ArtifactDownloader::new(
                http,
                Duration::from_secs(5),
                Duration::from_secs(10),
            ),
            verifier: IntegrityVerifier::new(
                TrustStore::new(vec![publisher.root.clone()]),
                clock.clone(),
            ),
            backups: Arc::new(
                BackupManager::new(&backup_dir, &install_dir, service.clone())
                    .with_clock(clock.clone()),
            ),
            installer: installer.clone(),
            service: service.clone(),
            policy: MaintenanceWindowPolicy::new(options.window),
            clock,
            status: status.clone(),
        };
        let orchestrator = UpdateOrchestrator::new(
            parts,
            OrchestratorOptions {
                download_dir: data_dir.join("downloads"),
                allow_prerelease: options.allow_prerelease,
                retry: RetryConfig {
                    max_retries: options.max_retries,
                    initial_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(50),
                    backoff_multiplier: 2.0,
                },
                reuse_backup_within: chrono::Duration::hours(24),
            },
        );

        Self {
            root,
            install_dir,
            data_dir,
            orchestrator: Arc::new(orchestrator),
            installer,
            service,
            status,
        }
    }

    pub fn agent_binary(&self) -> Vec<u8> {
        std::fs::read(self.install_dir.join("bin/agent.exe")).unwrap()
    }

    pub fn backup_count(&self) -> usize {
        self.orchestrator.backups().list_backups().len()
    }

    pub fn downloaded_artifact(&self) -> PathBuf {
        self.data_dir.join("downloads/WorkPulseAgent-5.1.0.msi")
    }
}
