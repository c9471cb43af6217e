// src/transaction/self_update.rs

//! Replacing cmam's own executable
//!
//! A running program cannot always overwrite itself, so self-update is split
//! in two phases:
//! 1. Stage: download and verify the new binary, place it next to the
//!    running one as `<exe>.cmam-new`, and write `pending-swap.json`.
//! 2. Swap: on the next launch, recovery moves the staged binary into place
//!    and records the new version.
//!
//! If the process dies between the two, the next launch either completes the
//! swap or discards it; it never leaves the executable missing.

use crate::cache::CacheEntry;
use crate::db::models::ChangesetStatus;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::hash::{self, Digest};
use crate::layout::Layout;
use crate::manifest::{InstalledPackage, ManifestGuard, reconcile};
use crate::package::{ArtifactDescriptor, PackageRef, VersionSpec};
use crate::transaction::engine::Tx;
use crate::transaction::history::History;
use crate::transaction::{Operation, TransactionEngine, TransactionReport, TxOutcome, TxState};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Registry name of cmam itself
pub const SELF_PACKAGE: &str = "cmam";

/// Marker for a staged self-update awaiting the next launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSwap {
    pub txid: String,
    /// The executable being replaced
    pub target: PathBuf,
    pub staged: PathBuf,
    pub digest: Digest,
    pub version: String,
    pub created_at: String,
}

impl PendingSwap {
    pub fn load(layout: &Layout) -> Result<Option<Self>> {
        let path = layout.pending_swap_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(format!("Failed to read {}", path.display()), e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))
    }

    fn write(&self, layout: &Layout) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        fsutil::write_atomic(&layout.pending_swap_path(), &bytes)
    }
}

/// How a pending self-update was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    Completed { version: String },
    /// The new binary was already in place; only the bookkeeping remained
    AlreadySwapped { version: String },
    Discarded { reason: String },
}

/// `<exe>.cmam-new`
pub fn staged_path(exe: &Path) -> PathBuf {
    with_suffix(exe, ".cmam-new")
}

/// Where the running binary is moved when it cannot be replaced in place
pub fn aside_path(exe: &Path) -> PathBuf {
    with_suffix(exe, ".cmam-old")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from(SELF_PACKAGE));
    name.push(suffix);
    path.with_file_name(name)
}

impl TransactionEngine {
    /// Stage a new cmam binary for the next launch
    pub fn self_update(&self, version: &VersionSpec, force: bool) -> Result<TransactionReport> {
        let package = PackageRef::new(SELF_PACKAGE, version.clone())?;
        let exe = self.self_exe()?;

        let mut tx = Tx::begin(self, Operation::SelfUpdate, SELF_PACKAGE);
        let (descriptor, artifact) = match self.fetch_artifact(&mut tx, &package) {
            Ok(fetched) => fetched,
            Err(e) => return self.conclude(tx, None, Err(e)),
        };

        let mut guard = match self.store.lock() {
            Ok(guard) => guard,
            Err(e) => return self.conclude(tx, None, Err(e)),
        };
        let result = self.stage_self_update(&mut tx, &mut guard, &exe, &descriptor, &artifact, force);
        self.conclude(tx, Some(&mut guard), result)
    }

    fn stage_self_update(
        &self,
        tx: &mut Tx<'_>,
        guard: &mut ManifestGuard<'_>,
        exe: &Path,
        descriptor: &ArtifactDescriptor,
        artifact: &CacheEntry,
        force: bool,
    ) -> Result<TransactionReport> {
        let prior = guard.load()?.get(SELF_PACKAGE).cloned();
        let running_version = prior
            .as_ref()
            .map(|p| p.version.clone())
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

        tx.journal.prior = prior;
        tx.journal.target = Some(InstalledPackage::new(
            SELF_PACKAGE,
            &descriptor.version,
            descriptor.expected_digest.clone(),
            exe.to_path_buf(),
        ));
        tx.history
            .set_versions(tx.txid(), Some(running_version.as_str()), Some(descriptor.version.as_str()));

        let current = hash::digest_file_if_exists(exe)?;
        if current.as_ref() == Some(&descriptor.expected_digest) && !force {
            info!("cmam {} is already running", descriptor.version);
            return Ok(tx.report(TxOutcome::Unchanged, None));
        }

        if let Some(previous) = PendingSwap::load(&self.layout).ok().flatten() {
            info!(
                "Replacing pending update to {} with {}",
                previous.version, descriptor.version
            );
        }

        let staged = staged_path(exe);
        let (digest, _) = fsutil::copy_atomic(&artifact.path, &staged)?;
        if digest != descriptor.expected_digest {
            fsutil::remove_file_if_exists(&staged)?;
            return Err(Error::ChecksumMismatch {
                expected: descriptor.expected_digest.to_string(),
                actual: digest.to_string(),
            });
        }

        if let Err(e) = tx.advance(TxState::Staged) {
            if matches!(e, Error::SimulatedCrash(_)) {
                return Err(e);
            }
            fsutil::remove_file_if_exists(&staged)?;
            return Err(Error::RolledBack {
                state: TxState::Staged,
                cause: Box::new(e),
            });
        }

        let pending = PendingSwap {
            txid: tx.txid().to_string(),
            target: exe.to_path_buf(),
            staged: staged.clone(),
            digest,
            version: descriptor.version.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        if let Err(e) = pending.write(&self.layout) {
            fsutil::remove_file_if_exists(&staged)?;
            return Err(e);
        }

        info!(
            "cmam {} staged at {}; it takes effect on the next launch",
            descriptor.version,
            staged.display()
        );
        Ok(tx.report(TxOutcome::Pending, None))
    }

    /// Second phase: put a staged self-update in place
    pub(crate) fn complete_pending_swap(
        &self,
        guard: &mut ManifestGuard<'_>,
    ) -> Result<Option<SwapOutcome>> {
        let marker = self.layout.pending_swap_path();
        let pending = match PendingSwap::load(&self.layout) {
            Ok(Some(pending)) => pending,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Discarding unreadable pending update: {}", e);
                fsutil::remove_file_if_exists(&marker)?;
                return Ok(Some(SwapOutcome::Discarded {
                    reason: e.to_string(),
                }));
            }
        };
        let history = History::open(&self.layout);

        let outcome = if hash::digest_file_if_exists(&pending.target)?.as_ref() == Some(&pending.digest) {
            SwapOutcome::AlreadySwapped {
                version: pending.version.clone(),
            }
        } else if hash::digest_file_if_exists(&pending.staged)?.as_ref() != Some(&pending.digest) {
            let reason = format!(
                "staged binary {} is missing or does not match {}",
                pending.staged.display(),
                pending.digest.short()
            );
            warn!("Discarding pending update to {}: {}", pending.version, reason);

            let aside = aside_path(&pending.target);
            if !pending.target.exists() && aside.exists() {
                fsutil::rename(&aside, &pending.target)?;
            }
            fsutil::remove_file_if_exists(&pending.staged)?;
            fsutil::remove_file_if_exists(&marker)?;
            history.finish(&pending.txid, ChangesetStatus::RolledBack, Some(reason.clone()));
            return Ok(Some(SwapOutcome::Discarded { reason }));
        } else {
            swap_into_place(&pending.staged, &pending.target)?;
            SwapOutcome::Completed {
                version: pending.version.clone(),
            }
        };

        let entry = InstalledPackage::new(
            SELF_PACKAGE,
            &pending.version,
            pending.digest.clone(),
            pending.target.clone(),
        );
        let mut manifest = guard.load()?;
        manifest.insert(entry.clone());
        guard.commit(&manifest)?;
        reconcile::write_marker(&self.layout, &entry)?;
        fsutil::remove_file_if_exists(&marker)?;

        fsutil::remove_file_if_exists(&pending.staged)?;
        if let Err(e) = fsutil::remove_file_if_exists(&aside_path(&pending.target)) {
            // Windows keeps the old image locked until it exits
            debug!("Leaving previous binary in place for now: {}", e);
        }

        history.finish(&pending.txid, ChangesetStatus::Applied, None);
        info!("cmam updated to {}", pending.version);
        Ok(Some(outcome))
    }
}

/// Rename `staged` over `target`, moving `target` aside if it is in use
fn swap_into_place(staged: &Path, target: &Path) -> Result<()> {
    let Err(direct) = fs::rename(staged, target) else {
        return Ok(());
    };
    debug!(
        "Direct replace of {} failed ({}); moving it aside",
        target.display(),
        direct
    );

    let aside = aside_path(target);
    fsutil::remove_file_if_exists(&aside)?;
    fsutil::rename(target, &aside)?;
    if let Err(e) = fsutil::rename(staged, target) {
        if let Err(restore) = fsutil::rename(&aside, target) {
            error!(
                "Failed to put {} back after an aborted swap: {}",
                target.display(),
                restore
            );
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_paths_keep_the_file_name() {
        let exe = Path::new("/opt/bin/cmam.exe");
        assert_eq!(staged_path(exe), Path::new("/opt/bin/cmam.exe.cmam-new"));
        assert_eq!(aside_path(exe), Path::new("/opt/bin/cmam.exe.cmam-old"));
    }

    #[test]
    fn test_swap_into_place_replaces_target() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("cmam");
        let staged = staged_path(&target);
        fs::write(&target, b"old").unwrap();
        fs::write(&staged, b"new").unwrap();

        swap_into_place(&staged, &target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert!(!staged.exists());
    }

    #[test]
    fn test_pending_swap_absent() {
        let temp = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp.path());
        assert!(PendingSwap::load(&layout).unwrap().is_none());
    }
}
