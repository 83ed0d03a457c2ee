//! Agent version identifiers and their ordering
//!
//! Versions follow `MAJOR.MINOR.PATCH[-PRERELEASE][+BUILD]`. Ordering looks
//! at the numeric core first; a release sorts above any pre-release of the
//! same core, and pre-release tags compare lexically by codepoint. Build
//! metadata is informational and ignored by both ordering and equality.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};

/// Parsed, immutable version identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionIdentifier {
    major: u64,
    minor: u64,
    patch: u64,
    pre_release: Option<String>,
    build: Option<String>,
}

impl VersionIdentifier {
    /// Construct a release version
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: None,
            build: None,
        }
    }

    /// Attach a pre-release tag, validating its shape
    pub fn with_pre_release(mut self, tag: &str) -> Result<Self> {
        validate_identifiers(tag, "pre-release").map_err(|reason| malformed(tag, reason))?;
        self.pre_release = Some(tag.to_string());
        Ok(self)
    }

    /// Attach build metadata, validating its shape
    pub fn with_build(mut self, tag: &str) -> Result<Self> {
        validate_identifiers(tag, "build").map_err(|reason| malformed(tag, reason))?;
        self.build = Some(tag.to_string());
        Ok(self)
    }

    /// Parse `MAJOR.MINOR.PATCH[-PRERELEASE][+BUILD]`
    pub fn parse(input: &str) -> Result<Self> {
        let (rest, build) = match input.split_once('+') {
            Some((rest, build)) => (rest, Some(build)),
            None => (input, None),
        };
        let (core, pre_release) = match rest.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (rest, None),
        };

        let mut fields = core.split('.');
        let major = parse_core_field(fields.next(), "major").map_err(|r| malformed(input, r))?;
        let minor = parse_core_field(fields.next(), "minor").map_err(|r| malformed(input, r))?;
        let patch = parse_core_field(fields.next(), "patch").map_err(|r| malformed(input, r))?;
        if fields.next().is_some() {
            return Err(malformed(input, "expected exactly three numeric fields".to_string()));
        }

        if let Some(pre) = pre_release {
            validate_identifiers(pre, "pre-release").map_err(|r| malformed(input, r))?;
        }
        if let Some(build) = build {
            validate_identifiers(build, "build").map_err(|r| malformed(input, r))?;
        }

        Ok(Self {
            major,
            minor,
            patch,
            pre_release: pre_release.map(str::to_string),
            build: build.map(str::to_string),
        })
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    pub fn patch(&self) -> u64 {
        self.patch
    }

    pub fn pre_release(&self) -> Option<&str> {
        self.pre_release.as_deref()
    }

    pub fn build(&self) -> Option<&str> {
        self.build.as_deref()
    }

    /// Whether this is a pre-release version
    pub fn is_pre_release(&self) -> bool {
        self.pre_release.is_some()
    }
}

/// Compare two version strings, failing on either malformed input
pub fn compare(a: &str, b: &str) -> Result<Ordering> {
    Ok(VersionIdentifier::parse(a)?.cmp(&VersionIdentifier::parse(b)?))
}

fn malformed(input: &str, reason: String) -> UpdateError {
    UpdateError::MalformedVersion {
        input: input.to_string(),
        reason,
    }
}

fn parse_core_field(field: Option<&str>, name: &str) -> std::result::Result<u64, String> {
    let field = field.ok_or_else(|| format!("missing {name} field"))?;
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("{name} field '{field}' is not a non-negative integer"));
    }
    field
        .parse::<u64>()
        .map_err(|_| format!("{name} field '{field}' is out of range"))
}

fn validate_identifiers(tag: &str, what: &str) -> std::result::Result<(), String> {
    if tag.is_empty() {
        return Err(format!("empty {what} tag"));
    }
    let valid = tag
        .split(['.', '-'])
        .all(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric()));
    if valid {
        Ok(())
    } else {
        Err(format!("{what} tag '{tag}' must be dot- or hyphen-separated alphanumerics"))
    }
}

impl PartialEq for VersionIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VersionIdentifier {}

impl Hash for VersionIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.major, self.minor, self.patch, &self.pre_release).hash(state);
    }
}

impl Ord for VersionIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for VersionIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VersionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre_release {
            write!(f, "-{pre}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl FromStr for VersionIdentifier {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionIdentifier {
    type Error = UpdateError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<VersionIdentifier> for String {
    fn from(value: VersionIdentifier) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> VersionIdentifier {
        VersionIdentifier::parse(s).unwrap()
    }

    #[test]
    fn test_parse_full_form() {
        let version = v("1.2.3-beta.1+build-77");
        assert_eq!((version.major(), version.minor(), version.patch()), (1, 2, 3));
        assert_eq!(version.pre_release(), Some("beta.1"));
        assert_eq!(version.build(), Some("build-77"));
    }

    #[test]
    fn test_hyphenated_pre_release_keeps_everything_after_first_hyphen() {
        let version = v("2.0.0-rc-1");
        assert_eq!(version.pre_release(), Some("rc-1"));
    }

    #[test]
    fn test_rejects_malformed() {
        for input in [
            "", "1", "1.2", "1.2.3.4", "v1.2.3", "-1.2.3", "1.x.3", "1.2.3-", "1.2.3+",
            "1.2.3-beta..1", "1.2.3-be_ta", "1.2.3+a+b", " 1.2.3", "99999999999999999999.0.0",
        ] {
            assert!(
                matches!(
                    VersionIdentifier::parse(input),
                    Err(UpdateError::MalformedVersion { .. })
                ),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_ordering() {
        assert!(v("1.2.3-beta.1") < v("1.2.3"));
        assert!(v("1.2.3") < v("1.3.0"));
        assert!(v("1.10.0") > v("1.9.9"));
        assert!(v("2.0.0-alpha") < v("2.0.0-beta"));
        assert!(v("5.0.0") < v("5.1.0"));
    }

    #[test]
    fn test_build_metadata_ignored() {
        assert_eq!(v("1.2.3+a"), v("1.2.3+b"));
        assert_eq!(v("1.2.3+a").cmp(&v("1.2.3")), Ordering::Equal);
        assert_ne!(v("1.2.3-rc.1"), v("1.2.3-rc.2"));
    }

    #[test]
    fn test_compare_strings() {
        assert_eq!(compare("1.0.0", "1.0.1").unwrap(), Ordering::Less);
        assert!(compare("1.0.0", "garbage").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&v("3.1.4-rc.1")).unwrap();
        assert_eq!(json, "\"3.1.4-rc.1\"");

        let parsed: VersionIdentifier = serde_json::from_str("\"3.1.4\"").unwrap();
        assert_eq!(parsed, VersionIdentifier::new(3, 1, 4));

        assert!(serde_json::from_str::<VersionIdentifier>("\"3.1\"").is_err());
    }
}
