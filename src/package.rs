// src/package.rs

//! Request-scoped package identities

use crate::error::{Error, Result};
use crate::hash::Digest;
use std::fmt;

/// Requested version: an exact version string or the newest available
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    Latest,
    Exact(String),
}

impl VersionSpec {
    /// `None` and `"latest"` both mean latest; a leading `v` is dropped
    pub fn from_option(version: Option<&str>) -> Self {
        match version.map(str::trim) {
            None | Some("") => VersionSpec::Latest,
            Some(v) if v.eq_ignore_ascii_case("latest") => VersionSpec::Latest,
            Some(v) => VersionSpec::Exact(strip_v(v).to_string()),
        }
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Latest => write!(f, "latest"),
            VersionSpec::Exact(v) => write!(f, "{}", v),
        }
    }
}

/// Package name plus requested version
///
/// Names are case-insensitive; the normalized (lowercase) form is the key
/// everywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    name: String,
    version: VersionSpec,
}

impl PackageRef {
    pub fn new(name: &str, version: VersionSpec) -> Result<Self> {
        Ok(Self {
            name: normalize_name(name)?,
            version,
        })
    }

    pub fn latest(name: &str) -> Result<Self> {
        Self::new(name, VersionSpec::Latest)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &VersionSpec {
        &self.version
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Registry metadata for one concrete version; untrusted until verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub version: String,
    pub download_url: String,
    pub expected_digest: Digest,
    /// File name placed into the install root
    pub entry_point: String,
}

impl ArtifactDescriptor {
    /// Reject entry points that would escape the install root
    pub fn validate(&self) -> Result<()> {
        let entry = self.entry_point.as_str();
        let bad = entry.is_empty()
            || entry == "."
            || entry == ".."
            || entry.starts_with('.')
            || entry.contains(['/', '\\', ':', '\0']);
        if bad {
            return Err(Error::InvalidArtifact(format!(
                "entry point '{}' for {} is not a plain file name",
                entry, self.name
            )));
        }
        if self.download_url.trim().is_empty() {
            return Err(Error::InvalidArtifact(format!(
                "no download URL for {} {}",
                self.name, self.version
            )));
        }
        Ok(())
    }
}

/// Lowercase and validate a package name
pub fn normalize_name(name: &str) -> Result<String> {
    let normalized = name.trim().to_ascii_lowercase();
    let valid = !normalized.is_empty()
        && !normalized.starts_with('.')
        && normalized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(normalized)
}

pub(crate) fn strip_v(version: &str) -> &str {
    version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        .unwrap_or(version)
}
