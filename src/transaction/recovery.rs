// src/transaction/recovery.rs

//! Rollback, roll-forward and startup recovery
//!
//! A journal left in the staging area means a transaction died after it
//! started touching the install root. On the next start each one is resolved
//! in exactly one direction:
//! - roll forward when the manifest already records the target and the file
//!   on disk matches it (only the cleanup was lost)
//! - roll back otherwise, restoring the prior file and manifest entry
//!
//! Recovery runs under the manifest lock and is skipped when another process
//! holds it, since that process may own the staging directories.

use crate::db::models::ChangesetStatus;
use crate::error::Result;
use crate::fsutil;
use crate::hash;
use crate::manifest::{Manifest, ManifestGuard, reconcile};
use crate::transaction::history::History;
use crate::transaction::journal::Journal;
use crate::transaction::self_update::{self, SwapOutcome};
use crate::transaction::{TransactionEngine, TxState};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Changesets that never reached `Staged` are expired after this long
const ABANDONED_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// What [`TransactionEngine::recover`] did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Transaction ids completed
    pub rolled_forward: Vec<String>,
    /// Transaction ids undone
    pub rolled_back: Vec<String>,
    /// Staging directories and stray staged binaries without a journal
    pub removed_orphans: usize,
    /// Interrupted work that could not be resolved
    pub unresolved: Vec<String>,
    pub swap: Option<SwapOutcome>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.rolled_forward.is_empty()
            && self.rolled_back.is_empty()
            && self.removed_orphans == 0
            && self.unresolved.is_empty()
            && self.swap.is_none()
    }
}

impl TransactionEngine {
    /// Resolve everything a previous invocation left behind
    ///
    /// Cheap when there is nothing to do: the lock is only taken if a
    /// staging directory, pending self-update or staged binary exists.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let staged_exe = self.self_exe().ok().map(|exe| self_update::staged_path(&exe));
        let has_work = !Journal::scan(&self.layout)?.is_empty()
            || self.layout.pending_swap_path().exists()
            || staged_exe.as_ref().is_some_and(|p| p.exists());
        if !has_work {
            return Ok(report);
        }

        let Some(mut guard) = self.store.try_lock()? else {
            debug!("Skipping recovery: another cmam process holds the manifest lock");
            return Ok(report);
        };
        let history = History::open(&self.layout);

        for (dir, journal) in Journal::scan(&self.layout)? {
            match journal {
                Ok(Some(mut journal)) => {
                    self.recover_journal(&mut guard, &history, &mut journal, &mut report)?;
                }
                Ok(None) => {
                    debug!("Removing orphaned staging directory {}", dir.display());
                    fsutil::remove_dir_if_exists(&dir)?;
                    report.removed_orphans += 1;
                }
                Err(e) => {
                    warn!("Cannot read journal in {}: {}", dir.display(), e);
                    report.unresolved.push(format!("{}: {}", dir.display(), e));
                }
            }
        }

        report.swap = self.complete_pending_swap(&mut guard)?;

        if let Some(staged) = staged_exe {
            if !self.layout.pending_swap_path().exists() && fsutil::remove_file_if_exists(&staged)? {
                debug!("Removed stray staged binary {}", staged.display());
                report.removed_orphans += 1;
            }
        }

        history.expire_pending(ABANDONED_AFTER);

        if !report.is_empty() {
            info!(
                "Recovery: {} rolled forward, {} rolled back, {} orphans removed, {} unresolved",
                report.rolled_forward.len(),
                report.rolled_back.len(),
                report.removed_orphans,
                report.unresolved.len()
            );
        }
        Ok(report)
    }

    fn recover_journal(
        &self,
        guard: &mut ManifestGuard<'_>,
        history: &History,
        journal: &mut Journal,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let txid = journal.txid.clone();
        let state = journal.state;
        let manifest = guard.load()?;

        // An interrupted rollback is always finished as a rollback
        if state != TxState::RollingBack && is_visible(&manifest, journal)? {
            info!(
                "Completing interrupted {} of {} ({})",
                journal.operation, journal.package, txid
            );
            self.roll_forward(journal)?;
            history.finish(&txid, ChangesetStatus::Applied, None);
            report.rolled_forward.push(txid);
            return Ok(());
        }

        if state >= TxState::Swapped && state != TxState::RollingBack {
            warn!(
                "Partial swap detected: {} of {} was interrupted in state {}",
                journal.operation, journal.package, state
            );
        }
        info!(
            "Rolling back interrupted {} of {} ({})",
            journal.operation, journal.package, txid
        );
        match self.roll_back(guard, journal) {
            Ok(()) => {
                history.finish(
                    &txid,
                    ChangesetStatus::RolledBack,
                    Some(format!("interrupted in state {}", state)),
                );
                report.rolled_back.push(txid);
            }
            Err(e) => {
                warn!("Could not roll back {}: {}", txid, e);
                report.unresolved.push(format!("{}: {}", txid, e));
            }
        }
        Ok(())
    }

    /// Undo a transaction that reached at least `Staged`
    ///
    /// Idempotent: running it again after an interruption converges on the
    /// prior state.
    pub(crate) fn roll_back(&self, guard: &mut ManifestGuard<'_>, journal: &mut Journal) -> Result<()> {
        journal.state = TxState::RollingBack;
        journal.write(&self.layout)?;
        let name = journal.package.clone();

        // The target file, unless it sits where the prior lives
        if let Some(target) = &journal.target {
            let own_path = journal
                .prior
                .as_ref()
                .is_none_or(|p| p.install_path != target.install_path);
            if own_path
                && hash::digest_file_if_exists(&target.install_path)?.as_ref() == Some(&target.digest)
            {
                debug!("Removing {}", target.install_path.display());
                fsutil::remove_file_if_exists(&target.install_path)?;
            }
        }

        if let Some(prior) = &journal.prior {
            let on_disk = hash::digest_file_if_exists(&prior.install_path)?;
            if on_disk.as_ref() != Some(&prior.digest) {
                let backup = match journal.backup_sequence {
                    Some(sequence) => self.backups.find(&name, sequence)?,
                    None => None,
                };
                match backup {
                    Some(record) => self.backups.restore(&record)?,
                    None => {
                        // No backup means the prior file was already gone
                        let holds_target = journal
                            .target
                            .as_ref()
                            .is_some_and(|t| on_disk.as_ref() == Some(&t.digest));
                        if holds_target {
                            fsutil::remove_file_if_exists(&prior.install_path)?;
                        }
                    }
                }
            }
        }

        // A forced install replaced a file cmam did not own; put it back
        if let Some(sequence) = journal.displaced_backup {
            if let Some(record) = self.backups.find(&name, sequence)? {
                let on_disk = hash::digest_file_if_exists(&record.entry.install_path)?;
                if on_disk.as_ref() != Some(&record.file_digest) {
                    self.backups.restore(&record)?;
                }
            }
        }

        let mut manifest = guard.load()?;
        if manifest.get(&name) != journal.prior.as_ref() {
            match &journal.prior {
                Some(prior) => {
                    manifest.insert(prior.clone());
                }
                None => {
                    manifest.remove(&name);
                }
            }
            guard.commit(&manifest)?;
        }
        match &journal.prior {
            Some(prior) => reconcile::write_marker(&self.layout, prior)?,
            None => reconcile::remove_marker(&self.layout, &name)?,
        }

        for sequence in journal.backup_sequence.into_iter().chain(journal.displaced_backup) {
            if let Some(record) = self.backups.find(&name, sequence)? {
                self.backups.discard(&record)?;
            }
        }
        fsutil::remove_dir_if_exists(&journal.dir(&self.layout))?;

        info!("Rolled back {} of {} ({})", journal.operation, name, journal.txid);
        Ok(())
    }

    /// Finish the cleanup of a transaction whose result is already visible
    fn roll_forward(&self, journal: &Journal) -> Result<()> {
        match &journal.target {
            Some(target) => reconcile::write_marker(&self.layout, target)?,
            None => reconcile::remove_marker(&self.layout, &journal.package)?,
        }
        self.finalize_commit(journal);
        Ok(())
    }

    /// Post-commit cleanup; returns the backup kept for the caller
    ///
    /// The transaction is already durable, so failures here are only logged.
    pub(crate) fn finalize_commit(&self, journal: &Journal) -> Option<u64> {
        let name = journal.package.as_str();

        if let Err(e) = fsutil::remove_dir_if_exists(&journal.dir(&self.layout)) {
            warn!("Failed to remove staging for {}: {}", journal.txid, e);
        }

        let mut discard = Vec::new();
        discard.extend(journal.consumed_backup);
        discard.extend(journal.displaced_backup);
        let mut retained = None;
        if let Some(sequence) = journal.backup_sequence {
            if journal.keep_backup {
                retained = Some(sequence);
            } else {
                discard.push(sequence);
            }
        }
        for sequence in discard {
            match self.backups.find(name, sequence) {
                Ok(Some(record)) => {
                    if let Err(e) = self.backups.discard(&record) {
                        warn!("Failed to discard backup #{} of {}: {}", sequence, name, e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to look up backup #{} of {}: {}", sequence, name, e),
            }
        }

        let protect = journal
            .target
            .as_ref()
            .and_then(|t| t.backup.as_ref())
            .map(|b| b.sequence);
        if let Err(e) = self.backups.prune(name, self.retention, protect) {
            warn!("Failed to prune backups of {}: {}", name, e);
        }

        retained
    }
}

/// Whether the manifest and disk already show the transaction's result
pub(crate) fn is_visible(manifest: &Manifest, journal: &Journal) -> Result<bool> {
    let current = manifest.get(&journal.package);
    match &journal.target {
        Some(target) => {
            let recorded = current.is_some_and(|entry| {
                entry.version == target.version
                    && entry.digest == target.digest
                    && entry.install_path == target.install_path
            });
            if !recorded {
                return Ok(false);
            }
            Ok(hash::digest_file_if_exists(&target.install_path)?.as_ref() == Some(&target.digest))
        }
        None => Ok(current.is_none()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::InstalledPackage;
    use crate::transaction::Operation;

    #[test]
    fn test_visibility_requires_manifest_and_disk() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("tool");
        std::fs::write(&path, b"new").unwrap();

        let target = InstalledPackage::new("tool", "2.0.0", hash::digest(b"new"), path.clone());
        let mut journal = Journal::new("tx-1", Operation::Update, "tool");
        journal.target = Some(target.clone());

        let mut manifest = Manifest::new();
        assert!(!is_visible(&manifest, &journal).unwrap());

        manifest.insert(target);
        assert!(is_visible(&manifest, &journal).unwrap());

        std::fs::write(&path, b"old").unwrap();
        assert!(!is_visible(&manifest, &journal).unwrap());
    }

    #[test]
    fn test_uninstall_is_visible_once_entry_is_gone() {
        let mut journal = Journal::new("tx-1", Operation::Uninstall, "tool");
        journal.prior = Some(InstalledPackage::new(
            "tool",
            "1.0.0",
            hash::digest(b"old"),
            "/nonexistent/tool".into(),
        ));

        let mut manifest = Manifest::new();
        assert!(is_visible(&manifest, &journal).unwrap());

        manifest.insert(journal.prior.clone().unwrap());
        assert!(!is_visible(&manifest, &journal).unwrap());
    }

    #[test]
    fn test_empty_report() {
        let report = RecoveryReport::default();
        assert!(report.is_empty());
    }
}
