//! Core data models for the updates system

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::VersionIdentifier;

/// Update metadata returned by `GET /updates/latest`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateArtifactDescriptor {
    /// Target version
    pub version: VersionIdentifier,
    /// Where to fetch the installer
    pub download_url: String,
    /// Installer file name; derived from the URL when absent
    #[serde(default)]
    pub file_name: Option<String>,
    /// Declared artifact size in bytes (0 = unknown)
    #[serde(default)]
    pub file_size: u64,
    /// Hex-encoded content checksum
    pub checksum: String,
    /// Algorithm of `checksum`
    #[serde(default)]
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Base64-encoded signature over the artifact's SHA-256 digest
    pub signature: String,
    /// Algorithm of `signature`
    #[serde(default)]
    pub signature_algorithm: SignatureAlgorithm,
    /// Certificate of the key that produced `signature`
    #[serde(default)]
    pub signing_certificate: Option<PublisherCertificate>,
    /// Intermediate certificates between the signer and a trusted root
    #[serde(default)]
    pub certificate_chain: Vec<PublisherCertificate>,
    /// Release timestamp
    pub release_date: DateTime<Utc>,
    /// Human-readable release notes
    #[serde(default)]
    pub release_notes: String,
    /// Install regardless of maintenance windows
    #[serde(default)]
    pub is_required: bool,
    /// Pre-release build
    #[serde(default)]
    pub is_pre_release: bool,
    /// Installations older than this must update (required semantics)
    #[serde(default)]
    pub minimum_version: Option<VersionIdentifier>,
}

impl UpdateArtifactDescriptor {
    /// File name to store the artifact under
    pub fn artifact_file_name(&self) -> String {
        let from_url = url::Url::parse(&self.download_url).ok().and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
                .filter(|name| !name.is_empty())
        });

        self.file_name
            .clone()
            .or(from_url)
            .map(|name| sanitize_file_name(&name))
            .unwrap_or_else(|| format!("workpulse-agent-{}.msi", self.version))
    }

    /// Whether the update must install now: flagged required, or the
    /// installed version is below the minimum-compatible floor.
    pub fn is_required_for(&self, installed: &VersionIdentifier) -> bool {
        self.is_required
            || self
                .minimum_version
                .as_ref()
                .is_some_and(|floor| installed < floor)
    }
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

/// Checksum algorithms accepted in descriptors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChecksumAlgorithm {
    /// SHA-256
    #[default]
    #[serde(alias = "SHA-256", alias = "sha256")]
    Sha256,
    /// SHA-512
    #[serde(alias = "SHA-512", alias = "sha512")]
    Sha512,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "SHA256"),
            ChecksumAlgorithm::Sha512 => write!(f, "SHA512"),
        }
    }
}

/// Signature algorithms accepted in descriptors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// Ed25519 over the artifact's SHA-256 digest
    #[default]
    #[serde(alias = "ed25519", alias = "ED25519")]
    Ed25519,
}

/// Intended uses of a publisher certificate's key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyUsage {
    /// May sign update artifacts
    CodeSigning,
    /// May sign other certificates
    CertificateSigning,
}

/// Publisher certificate: an Ed25519 key bound to a subject and a validity
/// period, signed by its issuer (self-signed for roots).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherCertificate {
    /// Subject name
    pub subject: String,
    /// Issuer subject name
    pub issuer: String,
    /// Base64-encoded 32-byte Ed25519 public key
    pub public_key: String,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// Allowed key usages
    pub key_usage: Vec<KeyUsage>,
    /// Base64-encoded issuer signature over `to_be_signed()`
    #[serde(default)]
    pub signature: Option<String>,
}

impl PublisherCertificate {
    /// Canonical bytes covered by the issuer's signature
    pub fn to_be_signed(&self) -> Vec<u8> {
        let mut usages: Vec<&str> = self
            .key_usage
            .iter()
            .map(|usage| match usage {
                KeyUsage::CodeSigning => "codeSigning",
                KeyUsage::CertificateSigning => "certificateSigning",
            })
            .collect();
        usages.sort_unstable();

        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.subject,
            self.issuer,
            self.public_key,
            self.not_before.to_rfc3339(),
            self.not_after.to_rfc3339(),
            usages.join(",")
        )
        .into_bytes()
    }

    /// Whether the key may be used for `usage`
    pub fn allows(&self, usage: KeyUsage) -> bool {
        self.key_usage.contains(&usage)
    }

    /// Whether `at` lies inside the validity period
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }

    /// Same subject and key
    pub fn same_identity(&self, other: &PublisherCertificate) -> bool {
        self.subject == other.subject && self.public_key == other.public_key
    }
}
