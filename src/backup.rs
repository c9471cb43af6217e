// src/backup.rs

//! Retained copies of previous installs
//!
//! Layout: `<root>/backups/<name>/<sequence:06>/` holding a copy of the
//! installed file and `entry.json` with the manifest entry it belonged to.
//! `entry.json` is written last, so a sequence directory without one is an
//! interrupted backup and is ignored. Sequence directories are created
//! exclusively and never reused.

use crate::error::{Error, Result};
use crate::fsutil;
use crate::hash::{self, Digest};
use crate::layout::Layout;
use crate::manifest::{BackupRef, InstalledPackage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const METADATA_FILE: &str = "entry.json";

/// A retained backup of one installed package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub name: String,
    pub sequence: u64,
    /// The sequence directory
    pub path: PathBuf,
    /// Manifest entry at the time of the backup
    pub entry: InstalledPackage,
    /// Copy of the installed file
    pub file: PathBuf,
    /// Digest of the bytes that were copied
    pub file_digest: Digest,
    pub created_at: String,
}

impl BackupRecord {
    pub fn reference(&self) -> BackupRef {
        BackupRef {
            path: self.path.clone(),
            sequence: self.sequence,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupMetadata {
    name: String,
    sequence: u64,
    created_at: String,
    file_name: String,
    file_digest: Digest,
    entry: InstalledPackage,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

impl BackupManager {
    pub fn new(layout: &Layout) -> Self {
        Self {
            dir: layout.backups_dir(),
        }
    }

    fn package_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Copy the installed file and its entry into a new sequence directory
    pub fn backup(&self, entry: &InstalledPackage) -> Result<BackupRecord> {
        let package_dir = self.package_dir(&entry.name);
        fs::create_dir_all(&package_dir).map_err(|e| {
            Error::io(format!("Failed to create {}", package_dir.display()), e)
        })?;

        let (sequence, seq_dir) = self.create_sequence_dir(&package_dir)?;

        let file_name = entry
            .install_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| entry.name.clone());
        let file = seq_dir.join(&file_name);
        let (file_digest, size) = fsutil::copy_atomic(&entry.install_path, &file)?;
        if file_digest != entry.digest {
            warn!(
                "Installed file for {} did not match its record ({} vs {}); backing up what is on disk",
                entry.name,
                file_digest.short(),
                entry.digest.short()
            );
        }

        let created_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let metadata = BackupMetadata {
            name: entry.name.clone(),
            sequence,
            created_at: created_at.clone(),
            file_name,
            file_digest: file_digest.clone(),
            entry: entry.clone(),
        };
        fsutil::write_atomic(
            &seq_dir.join(METADATA_FILE),
            &serde_json::to_vec_pretty(&metadata)?,
        )?;

        info!(
            "Backed up {} {} as #{} ({} bytes)",
            entry.name, entry.version, sequence, size
        );
        Ok(BackupRecord {
            name: entry.name.clone(),
            sequence,
            path: seq_dir,
            entry: entry.clone(),
            file,
            file_digest,
            created_at,
        })
    }

    /// Put the backed-up file back at its install path
    ///
    /// The backup copy is verified before and the restored file after the
    /// move; the manifest is left to the caller.
    pub fn restore(&self, record: &BackupRecord) -> Result<()> {
        let stored = hash::digest_file(&record.file)?;
        if stored != record.file_digest {
            return Err(Error::ChecksumMismatch {
                expected: record.file_digest.to_string(),
                actual: stored.to_string(),
            });
        }

        let (restored, _) = fsutil::copy_atomic(&record.file, &record.entry.install_path)?;
        if restored != record.file_digest {
            return Err(Error::ChecksumMismatch {
                expected: record.file_digest.to_string(),
                actual: restored.to_string(),
            });
        }

        info!(
            "Restored {} {} from backup #{}",
            record.name, record.entry.version, record.sequence
        );
        Ok(())
    }

    /// Complete backups of `name`, oldest first
    pub fn list(&self, name: &str) -> Result<Vec<BackupRecord>> {
        let package_dir = self.package_dir(name);
        let entries = match fs::read_dir(&package_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::io(format!("Failed to list {}", package_dir.display()), e));
            }
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| Error::io(format!("Failed to list {}", package_dir.display()), e))?;
            let Some(sequence) = parse_sequence(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            match read_record(&entry.path(), sequence) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => debug!("Ignoring incomplete backup {}", entry.path().display()),
                Err(e) => warn!("Ignoring unreadable backup {}: {}", entry.path().display(), e),
            }
        }
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    pub fn latest(&self, name: &str) -> Result<Option<BackupRecord>> {
        Ok(self.list(name)?.pop())
    }

    pub fn find(&self, name: &str, sequence: u64) -> Result<Option<BackupRecord>> {
        Ok(self
            .list(name)?
            .into_iter()
            .find(|r| r.sequence == sequence))
    }

    /// Delete one backup
    pub fn discard(&self, record: &BackupRecord) -> Result<()> {
        debug!("Discarding backup #{} of {}", record.sequence, record.name);
        fsutil::remove_dir_if_exists(&record.path)?;
        Ok(())
    }

    /// Keep the newest `retain` backups (plus `protect`), delete the rest
    ///
    /// Incomplete sequence directories are removed as well. Returns the
    /// sequences that were deleted.
    pub fn prune(&self, name: &str, retain: usize, protect: Option<u64>) -> Result<Vec<u64>> {
        let records = self.list(name)?;
        let keep_from = records.len().saturating_sub(retain);

        let mut removed = Vec::new();
        for record in &records[..keep_from] {
            if Some(record.sequence) == protect {
                continue;
            }
            self.discard(record)?;
            removed.push(record.sequence);
        }

        let kept: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        for orphan in self.incomplete_dirs(name, &kept)? {
            debug!("Removing incomplete backup {}", orphan.display());
            fsutil::remove_dir_if_exists(&orphan)?;
        }

        if !removed.is_empty() {
            info!("Pruned {} old backups of {}", removed.len(), name);
        }
        Ok(removed)
    }

    fn incomplete_dirs(&self, name: &str, complete: &[u64]) -> Result<Vec<PathBuf>> {
        let package_dir = self.package_dir(name);
        let Ok(entries) = fs::read_dir(&package_dir) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .flatten()
            .filter_map(|e| {
                let sequence = parse_sequence(&e.file_name().to_string_lossy())?;
                (!complete.contains(&sequence)).then(|| e.path())
            })
            .collect())
    }

    fn create_sequence_dir(&self, package_dir: &Path) -> Result<(u64, PathBuf)> {
        let mut sequence = self.max_sequence(package_dir)? + 1;
        loop {
            let dir = package_dir.join(format!("{:06}", sequence));
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((sequence, dir)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => sequence += 1,
                Err(e) => {
                    return Err(Error::io(format!("Failed to create {}", dir.display()), e));
                }
            }
        }
    }

    fn max_sequence(&self, package_dir: &Path) -> Result<u64> {
        let entries = fs::read_dir(package_dir)
            .map_err(|e| Error::io(format!("Failed to list {}", package_dir.display()), e))?;
        Ok(entries
            .flatten()
            .filter_map(|e| parse_sequence(&e.file_name().to_string_lossy()))
            .max()
            .unwrap_or(0))
    }
}

fn parse_sequence(name: &str) -> Option<u64> {
    if name.len() < 6 || !name.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

fn read_record(dir: &Path, sequence: u64) -> Result<Option<BackupRecord>> {
    let bytes = match fs::read(dir.join(METADATA_FILE)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(format!("Failed to read {}", dir.display()), e)),
    };
    let metadata: BackupMetadata = serde_json::from_slice(&bytes)?;
    if metadata.sequence != sequence {
        return Err(Error::ParseError(format!(
            "backup metadata claims sequence {}",
            metadata.sequence
        )));
    }

    let mut entry = metadata.entry;
    entry.name = metadata.name.clone();
    Ok(Some(BackupRecord {
        name: metadata.name,
        sequence,
        path: dir.to_path_buf(),
        entry,
        file: dir.join(metadata.file_name),
        file_digest: metadata.file_digest,
        created_at: metadata.created_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Layout, BackupManager) {
        let temp = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp.path());
        layout.ensure().unwrap();
        let manager = BackupManager::new(&layout);
        (temp, layout, manager)
    }

    fn installed(layout: &Layout, version: &str, contents: &[u8]) -> InstalledPackage {
        let path = layout.install_path("tool");
        fs::write(&path, contents).unwrap();
        InstalledPackage::new("tool", version, hash::digest(contents), path)
    }

    #[test]
    fn test_backup_restore_round_trip() {
        let (_temp, layout, manager) = setup();
        let entry = installed(&layout, "1.0.0", b"version one");

        let record = manager.backup(&entry).unwrap();
        assert_eq!(record.sequence, 1);
        assert_eq!(record.file_digest, entry.digest);

        fs::write(&entry.install_path, b"version two").unwrap();
        manager.restore(&record).unwrap();
        assert_eq!(fs::read(&entry.install_path).unwrap(), b"version one");

        let listed = manager.latest("tool").unwrap().unwrap();
        assert_eq!(listed, record);
    }

    #[test]
    fn test_restore_refuses_tampered_backup() {
        let (_temp, layout, manager) = setup();
        let entry = installed(&layout, "1.0.0", b"version one");
        let record = manager.backup(&entry).unwrap();

        fs::write(&record.file, b"tampered").unwrap();
        fs::write(&entry.install_path, b"current").unwrap();

        assert!(matches!(
            manager.restore(&record),
            Err(Error::ChecksumMismatch { .. })
        ));
        assert_eq!(fs::read(&entry.install_path).unwrap(), b"current");
    }

    #[test]
    fn test_sequences_increase_and_incomplete_dirs_are_ignored() {
        let (_temp, layout, manager) = setup();
        let entry = installed(&layout, "1.0.0", b"one");

        manager.backup(&entry).unwrap();
        fs::create_dir_all(layout.backups_dir().join("tool").join("000002")).unwrap();
        let third = manager.backup(&entry).unwrap();

        assert_eq!(third.sequence, 3);
        let sequences: Vec<u64> = manager.list("tool").unwrap().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 3]);
    }

    #[test]
    fn test_prune_keeps_newest_and_protected() {
        let (_temp, layout, manager) = setup();
        for version in ["1", "2", "3", "4"] {
            let entry = installed(&layout, version, version.as_bytes());
            manager.backup(&entry).unwrap();
        }

        let removed = manager.prune("tool", 1, Some(2)).unwrap();
        assert_eq!(removed, vec![1, 3]);

        let left: Vec<u64> = manager.list("tool").unwrap().iter().map(|r| r.sequence).collect();
        assert_eq!(left, vec![2, 4]);
        assert_eq!(manager.find("tool", 2).unwrap().unwrap().entry.version, "2");
    }

    #[test]
    fn test_no_backups() {
        let (_temp, _layout, manager) = setup();
        assert!(manager.list("ghost").unwrap().is_empty());
        assert!(manager.latest("ghost").unwrap().is_none());
        assert!(manager.prune("ghost", 1, None).unwrap().is_empty());
    }
}
