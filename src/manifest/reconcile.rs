// src/manifest/reconcile.rs

//! Rebuilding the manifest from what is actually on disk
//!
//! Every committed install leaves a marker in `<root>/markers/<name>.json`
//! naming the install path and the digest that was placed there. When the
//! manifest cannot be parsed, markers whose file still hashes to the recorded
//! digest are trusted; everything else is reported as a discrepancy.

use crate::error::{Error, Result};
use crate::fsutil;
use crate::hash::{self, Digest};
use crate::layout::Layout;
use crate::manifest::schema::{InstalledPackage, Manifest};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// On-disk version marker for one installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallMarker {
    pub name: String,
    pub version: String,
    pub digest: Digest,
    pub install_path: PathBuf,
    pub installed_at: String,
}

impl From<&InstalledPackage> for InstallMarker {
    fn from(entry: &InstalledPackage) -> Self {
        Self {
            name: entry.name.clone(),
            version: entry.version.clone(),
            digest: entry.digest.clone(),
            install_path: entry.install_path.clone(),
            installed_at: entry.installed_at.clone(),
        }
    }
}

impl From<InstallMarker> for InstalledPackage {
    fn from(marker: InstallMarker) -> Self {
        Self {
            name: marker.name,
            version: marker.version,
            digest: marker.digest,
            install_path: marker.install_path,
            installed_at: marker.installed_at,
            backup: None,
        }
    }
}

/// Something reconciliation could not vouch for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discrepancy {
    /// The file exists but no longer matches the marker
    DigestMismatch {
        name: String,
        path: PathBuf,
        expected: Digest,
        actual: Digest,
    },
    /// The marker names a file that is gone
    MissingFile { name: String, path: PathBuf },
    /// A marker that could not be read or parsed
    UnreadableMarker { path: PathBuf, reason: String },
    /// A file in the install root that no marker claims (informational)
    Untracked { path: PathBuf },
}

impl Discrepancy {
    /// Untracked files never block accepting a reconciled manifest
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Discrepancy::Untracked { .. })
    }
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discrepancy::DigestMismatch {
                name,
                path,
                expected,
                actual,
            } => write!(
                f,
                "{}: {} has digest {} but {} was installed",
                name,
                path.display(),
                actual.short(),
                expected.short()
            ),
            Discrepancy::MissingFile { name, path } => {
                write!(f, "{}: {} is missing", name, path.display())
            }
            Discrepancy::UnreadableMarker { path, reason } => {
                write!(f, "unreadable marker {}: {}", path.display(), reason)
            }
            Discrepancy::Untracked { path } => {
                write!(f, "untracked file {}", path.display())
            }
        }
    }
}

/// Result of a reconciliation scan
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    /// Entries whose files verified
    pub manifest: Manifest,
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconcileReport {
    pub fn unresolved(&self) -> Vec<&Discrepancy> {
        self.discrepancies.iter().filter(|d| d.is_blocking()).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.unresolved().is_empty()
    }
}

pub fn marker_path(layout: &Layout, name: &str) -> PathBuf {
    layout.markers_dir().join(format!("{}.json", name))
}

/// Write (or replace) the marker for an entry
pub fn write_marker(layout: &Layout, entry: &InstalledPackage) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(&InstallMarker::from(entry))?;
    fsutil::write_atomic(&marker_path(layout, &entry.name), &bytes)
}

pub fn remove_marker(layout: &Layout, name: &str) -> Result<()> {
    fsutil::remove_file_if_exists(&marker_path(layout, name))?;
    Ok(())
}

/// Read the marker for one package, if present and well-formed
pub fn read_marker(layout: &Layout, name: &str) -> Option<InstallMarker> {
    let bytes = fs::read(marker_path(layout, name)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Rebuild a manifest from the marker directory
pub fn reconcile(layout: &Layout) -> Result<ReconcileReport> {
    let mut manifest = Manifest::new();
    let mut discrepancies = Vec::new();
    let mut claimed = HashSet::new();

    let markers_dir = layout.markers_dir();
    let entries = match fs::read_dir(&markers_dir) {
        Ok(entries) => entries.collect::<io::Result<Vec<_>>>().map_err(|e| {
            Error::io(format!("Failed to list {}", markers_dir.display()), e)
        })?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(Error::io(
                format!("Failed to list {}", markers_dir.display()),
                e,
            ));
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .into_iter()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    for path in paths {
        let marker = match read_marker_file(&path) {
            Ok(marker) => marker,
            Err(reason) => {
                discrepancies.push(Discrepancy::UnreadableMarker { path, reason });
                continue;
            }
        };
        claimed.insert(marker.install_path.clone());

        match hash::digest_file_if_exists(&marker.install_path)? {
            Some(actual) if actual == marker.digest => {
                debug!("Reconciled {} {}", marker.name, marker.version);
                manifest.insert(marker.into());
            }
            Some(actual) => discrepancies.push(Discrepancy::DigestMismatch {
                name: marker.name,
                path: marker.install_path,
                expected: marker.digest,
                actual,
            }),
            None => discrepancies.push(Discrepancy::MissingFile {
                name: marker.name,
                path: marker.install_path,
            }),
        }
    }

    for path in untracked_files(&layout.scripts_dir(), &claimed)? {
        discrepancies.push(Discrepancy::Untracked { path });
    }

    for d in &discrepancies {
        if d.is_blocking() {
            warn!("Reconciliation: {}", d);
        }
    }

    Ok(ReconcileReport {
        manifest,
        discrepancies,
    })
}

fn read_marker_file(path: &Path) -> std::result::Result<InstallMarker, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    let marker: InstallMarker = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;

    let expected_stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    if marker.name != expected_stem {
        return Err(format!(
            "marker names package '{}' but is stored as '{}'",
            marker.name, expected_stem
        ));
    }
    Ok(marker)
}

fn untracked_files(scripts_dir: &Path, claimed: &HashSet<PathBuf>) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(scripts_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::io(
                format!("Failed to list {}", scripts_dir.display()),
                e,
            ));
        }
    };

    let mut untracked = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::io(format!("Failed to list {}", scripts_dir.display()), e))?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || !path.is_file() || claimed.contains(&path) {
            continue;
        }
        untracked.push(path);
    }
    untracked.sort();
    Ok(untracked)
}
