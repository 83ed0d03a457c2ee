//! Artifact integrity: checksum and publisher signature
//!
//! Both checks must pass. A rejected artifact is deleted before the error is
//! returned so nothing downstream can pick it up.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, VerifyingKey};
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, info, warn};

use crate::error::{Result, UpdateError};
use crate::models::{ChecksumAlgorithm, KeyUsage, PublisherCertificate, UpdateArtifactDescriptor};
use crate::policy::Clock;

/// Longest issuer chain walked before giving up
const MAX_CHAIN_DEPTH: usize = 8;
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Certificates the agent trusts to vouch for update publishers
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    certificates: Vec<PublisherCertificate>,
}

impl TrustStore {
    /// Create a trust store from certificates
    pub fn new(certificates: Vec<PublisherCertificate>) -> Self {
        Self { certificates }
    }

    /// Load a JSON array of certificates
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            UpdateError::config(format!("cannot read trust store {}: {e}", path.display()))
        })?;
        let certificates: Vec<PublisherCertificate> = serde_json::from_str(&content)?;
        for cert in &certificates {
            decode_public_key(cert).map_err(|e| {
                UpdateError::config(format!("trust store entry '{}': {e}", cert.subject))
            })?;
        }
        info!(path = %path.display(), count = certificates.len(), "Loaded trust store");
        Ok(Self { certificates })
    }

    /// Whether `cert` is pinned in the store
    pub fn is_trusted(&self, cert: &PublisherCertificate) -> bool {
        self.certificates.iter().any(|c| c.same_identity(cert))
    }

    pub fn certificates(&self) -> &[PublisherCertificate] {
        &self.certificates
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

/// Digests computed in one pass over the artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDigests {
    pub sha256: [u8; 32],
    pub sha512: Vec<u8>,
}

impl ArtifactDigests {
    /// Digest for a declared algorithm
    pub fn for_algorithm(&self, algorithm: ChecksumAlgorithm) -> &[u8] {
        match algorithm {
            ChecksumAlgorithm::Sha256 => &self.sha256,
            ChecksumAlgorithm::Sha512 => &self.sha512,
        }
    }
}

/// Outcome of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    /// Hex SHA-256 of the artifact
    pub sha256: String,
    /// Subject of the certificate that signed it
    pub signer: String,
}

/// Checks downloaded artifacts against their descriptor
pub struct IntegrityVerifier {
    trust_store: TrustStore,
    clock: Arc<dyn Clock>,
}

impl IntegrityVerifier {
    /// Create a verifier
    pub fn new(trust_store: TrustStore, clock: Arc<dyn Clock>) -> Self {
        Self { trust_store, clock }
    }

    /// Verify checksum and signature; delete the artifact on any failure.
    pub async fn verify(
        &self,
        artifact: &Path,
        descriptor: &UpdateArtifactDescriptor,
    ) -> Result<VerificationReport> {
        let result = self.verify_inner(artifact, descriptor).await;
        if let Err(e) = &result {
            warn!(path = %artifact.display(), error = %e, "Rejecting update artifact");
            discard_artifact(artifact).await;
        }
        result
    }

    async fn verify_inner(
        &self,
        artifact: &Path,
        descriptor: &UpdateArtifactDescriptor,
    ) -> Result<VerificationReport> {
        let digests = compute_digests(artifact.to_path_buf()).await?;

        verify_checksum(&digests, descriptor)?;
        debug!(algorithm = %descriptor.checksum_algorithm, "Checksum verified");

        let signer = self.verify_signature(&digests.sha256, descriptor)?;
        info!(version = %descriptor.version, signer = %signer, "Artifact integrity verified");

        Ok(VerificationReport {
            sha256: hex::encode(digests.sha256),
            signer,
        })
    }

    /// Verify the descriptor signature over `sha256`; returns the signer
    pub fn verify_signature(
        &self,
        sha256: &[u8; 32],
        descriptor: &UpdateArtifactDescriptor,
    ) -> Result<String> {
        let signature = decode_signature(&descriptor.signature)?;
        let now = self.clock.now_utc();

        if let Some(leaf) = &descriptor.signing_certificate {
            let key = decode_public_key(leaf)?;
            key.verify_strict(sha256, &signature)
                .map_err(|_| UpdateError::integrity("signature does not match artifact"))?;
            self.validate_chain(leaf, &descriptor.certificate_chain, now)?;
            return Ok(leaf.subject.clone());
        }

        // No certificate shipped: accept any pinned code-signing key.
        self.trust_store
            .certificates()
            .iter()
            .filter(|cert| cert.allows(KeyUsage::CodeSigning) && cert.is_valid_at(now))
            .find(|cert| {
                decode_public_key(cert)
                    .map(|key| key.verify_strict(sha256, &signature).is_ok())
                    .unwrap_or(false)
            })
            .map(|cert| cert.subject.clone())
            .ok_or_else(|| UpdateError::integrity("signature not produced by a trusted publisher"))
    }

    /// Walk issuers from `leaf` until a trusted certificate is reached
    fn validate_chain(
        &self,
        leaf: &PublisherCertificate,
        intermediates: &[PublisherCertificate],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !leaf.allows(KeyUsage::CodeSigning) {
            return Err(UpdateError::integrity(format!(
                "certificate '{}' is not valid for code signing",
                leaf.subject
            )));
        }
        if !leaf.is_valid_at(now) {
            return Err(UpdateError::integrity(format!(
                "certificate '{}' is expired or not yet valid",
                leaf.subject
            )));
        }

        let mut current = leaf;
        for _ in 0..MAX_CHAIN_DEPTH {
            if self.trust_store.is_trusted(current) {
                return Ok(());
            }

            let issuer = intermediates
                .iter()
                .chain(self.trust_store.certificates())
                .filter(|candidate| candidate.subject == current.issuer)
                .find(|candidate| verify_issued_by(current, candidate).is_ok())
                .ok_or_else(|| {
                    UpdateError::integrity(format!(
                        "certificate '{}' does not chain to a trusted publisher",
                        current.subject
                    ))
                })?;

            if !issuer.allows(KeyUsage::CertificateSigning) {
                return Err(UpdateError::integrity(format!(
                    "issuer '{}' may not sign certificates",
                    issuer.subject
                )));
            }
            if !issuer.is_valid_at(now) {
                return Err(UpdateError::integrity(format!(
                    "issuer '{}' is expired or not yet valid",
                    issuer.subject
                )));
            }
            if std::ptr::eq(issuer, current) {
                // Self-signed but not pinned
                break;
            }
            current = issuer;
        }

        Err(UpdateError::integrity(format!(
            "certificate '{}' does not chain to a trusted publisher",
            leaf.subject
        )))
    }
}

/// Hash the file with every supported algorithm
pub async fn compute_digests(path: PathBuf) -> Result<ArtifactDigests> {
    tokio::task::spawn_blocking(move || -> Result<ArtifactDigests> {
        let mut file = File::open(&path)?;
        let mut sha256 = Sha256::new();
        let mut sha512 = Sha512::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            sha256.update(&buf[..n]);
            sha512.update(&buf[..n]);
        }
        Ok(ArtifactDigests {
            sha256: sha256.finalize().into(),
            sha512: sha512.finalize().to_vec(),
        })
    })
    .await
    .map_err(|e| UpdateError::integrity(format!("hashing task failed: {e}")))?
}

fn verify_checksum(digests: &ArtifactDigests, descriptor: &UpdateArtifactDescriptor) -> Result<()> {
    let expected = hex::decode(descriptor.checksum.trim()).map_err(|e| {
        UpdateError::integrity(format!("descriptor checksum is not valid hex: {e}"))
    })?;
    let actual = digests.for_algorithm(descriptor.checksum_algorithm);

    if expected.as_slice() != actual {
        return Err(UpdateError::integrity(format!(
            "{} mismatch: expected {}, got {}",
            descriptor.checksum_algorithm,
            hex::encode(&expected),
            hex::encode(actual)
        )));
    }
    Ok(())
}

fn verify_issued_by(cert: &PublisherCertificate, issuer: &PublisherCertificate) -> Result<()> {
    let encoded = cert
        .signature
        .as_deref()
        .ok_or_else(|| UpdateError::integrity(format!("certificate '{}' is unsigned", cert.subject)))?;
    let signature = decode_signature(encoded)?;
    let key = decode_public_key(issuer)?;
    key.verify_strict(&cert.to_be_signed(), &signature)
        .map_err(|_| UpdateError::integrity(format!("bad issuer signature on '{}'", cert.subject)))
}

fn decode_public_key(cert: &PublisherCertificate) -> Result<VerifyingKey> {
    let bytes = BASE64
        .decode(cert.public_key.trim())
        .map_err(|e| UpdateError::integrity(format!("public key is not base64: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| UpdateError::integrity("Ed25519 public key must decode to 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| UpdateError::integrity("invalid Ed25519 public key bytes"))
}

fn decode_signature(encoded: &str) -> Result<Signature> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| UpdateError::integrity(format!("signature is not base64: {e}")))?;
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| UpdateError::integrity("Ed25519 signature must decode to 64 bytes"))?;
    Ok(Signature::from_bytes(&bytes))
}

async fn discard_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Deleted rejected artifact"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete rejected artifact"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignatureAlgorithm;
    use crate::policy::FixedClock;
    use crate::version::VersionIdentifier;
    use chrono::{Duration, NaiveDate};
    use ed25519_dalek::{Signer, SigningKey};
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(2026, 10, 16)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc()
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock::at(now().naive_utc()))
    }

    fn cert(
        subject: &str,
        issuer: &str,
        key: &SigningKey,
        usage: Vec<KeyUsage>,
        signer: &SigningKey,
    ) -> PublisherCertificate {
        let mut cert = PublisherCertificate {
            subject: subject.to_string(),
            issuer: issuer.to_string(),
            public_key: BASE64.encode(key.verifying_key().to_bytes()),
            not_before: now() - Duration::days(30),
            not_after: now() + Duration::days(365),
            key_usage: usage,
            signature: None,
        };
        cert.signature = Some(BASE64.encode(signer.sign(&cert.to_be_signed()).to_bytes()));
        cert
    }

    struct Fixture {
        _dir: TempDir,
        artifact: PathBuf,
        descriptor: UpdateArtifactDescriptor,
        root: PublisherCertificate,
        leaf_key: SigningKey,
        root_key: SigningKey,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("agent.msi");
        let content = b"installer payload".repeat(100);
        std::fs::write(&artifact, &content).unwrap();

        let root_key = SigningKey::from_bytes(&[1u8; 32]);
        let leaf_key = SigningKey::from_bytes(&[2u8; 32]);
        let root = cert(
            "WorkPulse Root",
            "WorkPulse Root",
            &root_key,
            vec![KeyUsage::CertificateSigning],
            &root_key,
        );
        let leaf = cert(
            "WorkPulse Release Signing",
            "WorkPulse Root",
            &leaf_key,
            vec![KeyUsage::CodeSigning],
            &root_key,
        );

        let digest: [u8; 32] = Sha256::digest(&content).into();
        let descriptor = UpdateArtifactDescriptor {
            version: VersionIdentifier::new(5, 1, 0),
            download_url: "https://updates.example.com/agent.msi".to_string(),
            file_name: None,
            file_size: content.len() as u64,
            checksum: hex::encode(digest),
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            signature: BASE64.encode(leaf_key.sign(&digest).to_bytes()),
            signature_algorithm: SignatureAlgorithm::Ed25519,
            signing_certificate: Some(leaf),
            certificate_chain: vec![],
            release_date: now(),
            release_notes: String::new(),
            is_required: false,
            is_pre_release: false,
            minimum_version: None,
        };

        Fixture {
            _dir: dir,
            artifact,
            descriptor,
            root,
            leaf_key,
            root_key,
        }
    }

    fn verifier(f: &Fixture) -> IntegrityVerifier {
        IntegrityVerifier::new(TrustStore::new(vec![f.root.clone()]), clock())
    }

    #[tokio::test]
    async fn test_valid_artifact_passes() {
        let f = fixture();
        let report = verifier(&f).verify(&f.artifact, &f.descriptor).await.unwrap();
        assert_eq!(report.signer, "WorkPulse Release Signing");
        assert_eq!(report.sha256, f.descriptor.checksum);
        assert!(f.artifact.exists());
    }

    #[tokio::test]
    async fn test_sha512_checksum() {
        let mut f = fixture();
        let digests = compute_digests(f.artifact.clone()).await.unwrap();
        f.descriptor.checksum = hex::encode(&digests.sha512).to_uppercase();
        f.descriptor.checksum_algorithm = ChecksumAlgorithm::Sha512;
        assert!(verifier(&f).verify(&f.artifact, &f.descriptor).await.is_ok());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_deletes_artifact() {
        let mut f = fixture();
        f.descriptor.checksum = "00".repeat(32);
        let err = verifier(&f).verify(&f.artifact, &f.descriptor).await.unwrap_err();
        assert!(matches!(err, UpdateError::Integrity { .. }));
        assert!(!f.artifact.exists());
    }

    #[tokio::test]
    async fn test_tampered_signature_rejected() {
        let mut f = fixture();
        let other = SigningKey::from_bytes(&[9u8; 32]);
        f.descriptor.signature = BASE64.encode(other.sign(&[0u8; 32]).to_bytes());
        let err = verifier(&f).verify(&f.artifact, &f.descriptor).await.unwrap_err();
        assert!(matches!(err, UpdateError::Integrity { .. }));
        assert!(!f.artifact.exists());
    }

    #[tokio::test]
    async fn test_untrusted_root_rejected() {
        let f = fixture();
        let stranger = SigningKey::from_bytes(&[7u8; 32]);
        let other_root = cert(
            "Other Root",
            "Other Root",
            &stranger,
            vec![KeyUsage::CertificateSigning],
            &stranger,
        );
        let verifier = IntegrityVerifier::new(TrustStore::new(vec![other_root]), clock());
        assert!(verifier.verify(&f.artifact, &f.descriptor).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_signing_certificate_rejected() {
        let mut f = fixture();
        let mut leaf = f.descriptor.signing_certificate.clone().unwrap();
        leaf.not_after = now() - Duration::days(1);
        leaf.signature = Some(BASE64.encode(f.root_key.sign(&leaf.to_be_signed()).to_bytes()));
        f.descriptor.signing_certificate = Some(leaf);

        let err = verifier(&f).verify(&f.artifact, &f.descriptor).await.unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_certificate_without_code_signing_usage_rejected() {
        let mut f = fixture();
        let leaf = cert(
            "WorkPulse Release Signing",
            "WorkPulse Root",
            &f.leaf_key,
            vec![KeyUsage::CertificateSigning],
            &f.root_key,
        );
        f.descriptor.signing_certificate = Some(leaf);

        let err = verifier(&f).verify(&f.artifact, &f.descriptor).await.unwrap_err();
        assert!(err.to_string().contains("code signing"));
    }

    #[tokio::test]
    async fn test_chain_through_intermediate() {
        let mut f = fixture();
        let intermediate_key = SigningKey::from_bytes(&[3u8; 32]);
        let intermediate = cert(
            "WorkPulse Intermediate",
            "WorkPulse Root",
            &intermediate_key,
            vec![KeyUsage::CertificateSigning],
            &f.root_key,
        );
        let leaf = cert(
            "WorkPulse Release Signing",
            "WorkPulse Intermediate",
            &f.leaf_key,
            vec![KeyUsage::CodeSigning],
            &intermediate_key,
        );
        f.descriptor.signing_certificate = Some(leaf);
        f.descriptor.certificate_chain = vec![intermediate];

        assert!(verifier(&f).verify(&f.artifact, &f.descriptor).await.is_ok());
    }

    #[tokio::test]
    async fn test_pinned_key_without_shipped_certificate() {
        let mut f = fixture();
        let pinned = f.descriptor.signing_certificate.take().unwrap();
        let verifier = IntegrityVerifier::new(TrustStore::new(vec![pinned]), clock());

        let report = verifier.verify(&f.artifact, &f.descriptor).await.unwrap();
        assert_eq!(report.signer, "WorkPulse Release Signing");
    }

    #[test]
    fn test_trust_store_load_rejects_bad_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trust.json");
        let mut root = fixture().root;
        root.public_key = "AAAA".to_string();
        std::fs::write(&path, serde_json::to_string(&vec![root]).unwrap()).unwrap();

        assert!(matches!(TrustStore::load(&path), Err(UpdateError::Config { .. })));
    }
}
