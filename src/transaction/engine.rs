// src/transaction/engine.rs

//! Install, update, uninstall and restore transactions

use crate::backup::BackupRecord;
use crate::cache::CacheEntry;
use crate::db::models::ChangesetStatus;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::hash;
use crate::manifest::{InstalledPackage, ManifestGuard, reconcile};
use crate::package::{ArtifactDescriptor, PackageRef, normalize_name};
use crate::transaction::history::History;
use crate::transaction::journal::Journal;
use crate::transaction::{
    Operation, SELF_PACKAGE, TransactionEngine, TransactionReport, TxOutcome, TxState, new_txid,
};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Version recorded on the backup of a displaced untracked file
const UNTRACKED_VERSION: &str = "untracked";

/// Whether anything (file, link, directory) exists at `path`
fn occupied(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// One in-flight transaction
pub(crate) struct Tx<'e> {
    engine: &'e TransactionEngine,
    pub(crate) journal: Journal,
    pub(crate) history: History,
    /// The staging directory (and journal) exist
    on_disk: bool,
}

impl<'e> Tx<'e> {
    pub(crate) fn begin(engine: &'e TransactionEngine, operation: Operation, package: &str) -> Self {
        let txid = new_txid();
        info!("Starting {} of {} (transaction {})", operation, package, txid);
        let history = History::open(&engine.layout);
        history.start(&txid, operation, package);
        Self {
            engine,
            journal: Journal::new(&txid, operation, package),
            history,
            on_disk: false,
        }
    }

    pub(crate) fn txid(&self) -> &str {
        &self.journal.txid
    }

    /// Record reaching `state`, then honor cancellation and injected faults
    pub(crate) fn advance(&mut self, state: TxState) -> Result<()> {
        self.journal.state = state;
        if self.on_disk {
            self.journal.write(&self.engine.layout)?;
        }
        debug!("Transaction {} reached {}", self.journal.txid, state);
        self.engine.checkpoint(state)
    }

    /// Create the staging directory and first journal
    fn stage(&mut self) -> Result<PathBuf> {
        let dir = self.journal.dir(&self.engine.layout);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("Failed to create {}", dir.display()), e))?;
        self.journal.write(&self.engine.layout)?;
        self.on_disk = true;
        Ok(dir)
    }

    pub(crate) fn report(&self, outcome: TxOutcome, backup: Option<u64>) -> TransactionReport {
        TransactionReport {
            txid: self.journal.txid.clone(),
            operation: self.journal.operation,
            package: self.journal.package.clone(),
            from_version: self.journal.prior.as_ref().map(|p| p.version.clone()),
            to_version: self.journal.target.as_ref().map(|t| t.version.clone()),
            outcome,
            install_path: self
                .journal
                .target
                .as_ref()
                .map(|t| t.install_path.clone()),
            backup,
        }
    }
}

impl TransactionEngine {
    /// Install a package, or reinstall/upgrade it if already present
    ///
    /// Installing the digest that is already in place is a no-op unless
    /// `force` is set.
    pub fn install(&self, package: &PackageRef, force: bool) -> Result<TransactionReport> {
        if package.name() == SELF_PACKAGE {
            return self.self_update(package.version(), force);
        }
        self.deploy(Operation::Install, package, force, false)
    }

    /// Move an installed package to another version
    ///
    /// With `keep_backup` the replaced version stays restorable through
    /// [`TransactionEngine::restore`].
    pub fn update(&self, package: &PackageRef, keep_backup: bool) -> Result<TransactionReport> {
        if package.name() == SELF_PACKAGE {
            return self.self_update(package.version(), false);
        }
        if self.store.snapshot()?.get(package.name()).is_none() {
            return Err(Error::NotInstalled(package.name().to_string()));
        }
        self.deploy(Operation::Update, package, false, keep_backup)
    }

    /// Remove a package; its last version is kept as a backup
    pub fn uninstall(&self, name: &str) -> Result<TransactionReport> {
        let name = normalize_name(name)?;
        if name == SELF_PACKAGE {
            return Err(Error::InvalidName(format!(
                "{} cannot uninstall itself",
                SELF_PACKAGE
            )));
        }

        let mut tx = Tx::begin(self, Operation::Uninstall, &name);
        let mut guard = match self.store.lock() {
            Ok(guard) => guard,
            Err(e) => return self.conclude(tx, None, Err(e)),
        };
        let result = self.apply_uninstall(&mut tx, &mut guard, &name);
        self.conclude(tx, Some(&mut guard), result)
    }

    /// Swap the most recent backup of a package back in
    pub fn restore(&self, name: &str) -> Result<TransactionReport> {
        let name = normalize_name(name)?;

        let mut tx = Tx::begin(self, Operation::Restore, &name);
        let mut guard = match self.store.lock() {
            Ok(guard) => guard,
            Err(e) => return self.conclude(tx, None, Err(e)),
        };
        let result = self.apply_restore(&mut tx, &mut guard, &name);
        self.conclude(tx, Some(&mut guard), result)
    }

    fn deploy(
        &self,
        operation: Operation,
        package: &PackageRef,
        force: bool,
        keep_backup: bool,
    ) -> Result<TransactionReport> {
        let mut tx = Tx::begin(self, operation, package.name());

        let (descriptor, entry) = match self.fetch_artifact(&mut tx, package) {
            Ok(fetched) => fetched,
            Err(e) => return self.conclude(tx, None, Err(e)),
        };

        let mut guard = match self.store.lock() {
            Ok(guard) => guard,
            Err(e) => return self.conclude(tx, None, Err(e)),
        };
        let result = self.apply_deploy(&mut tx, &mut guard, &descriptor, &entry, force, keep_backup);
        self.conclude(tx, Some(&mut guard), result)
    }

    /// Requested -> Fetching -> Verified, without the manifest lock
    pub(crate) fn fetch_artifact(
        &self,
        tx: &mut Tx<'_>,
        package: &PackageRef,
    ) -> Result<(ArtifactDescriptor, CacheEntry)> {
        tx.advance(TxState::Requested)?;
        let mut descriptor = self.registry.resolve(package)?;
        descriptor.name = package.name().to_string();
        descriptor.validate()?;
        info!(
            "Resolved {} to version {} ({})",
            package,
            descriptor.version,
            descriptor.expected_digest.short()
        );

        tx.advance(TxState::Fetching)?;
        let entry = self.downloader.fetch(&descriptor)?;

        tx.advance(TxState::Verified)?;
        Ok((descriptor, entry))
    }

    fn apply_deploy(
        &self,
        tx: &mut Tx<'_>,
        guard: &mut ManifestGuard<'_>,
        descriptor: &ArtifactDescriptor,
        artifact: &CacheEntry,
        force: bool,
        keep_backup: bool,
    ) -> Result<TransactionReport> {
        let name = descriptor.name.as_str();
        let mut manifest = guard.load()?;
        let prior = manifest.get(name).cloned();

        if tx.journal.operation == Operation::Update && prior.is_none() {
            return Err(Error::NotInstalled(name.to_string()));
        }

        let install_path = self.layout.install_path(&descriptor.entry_point);
        if let Some(owner) = manifest.owner_of(&install_path) {
            if owner.name != name {
                return Err(Error::PathConflict {
                    path: install_path,
                    owner: owner.name.clone(),
                });
            }
        }

        let untracked = manifest.owner_of(&install_path).is_none() && occupied(&install_path);
        if untracked && !force {
            return Err(Error::UntrackedFile { path: install_path });
        }

        let mut target = InstalledPackage::new(
            name,
            &descriptor.version,
            descriptor.expected_digest.clone(),
            install_path.clone(),
        );
        tx.journal.prior = prior.clone();
        tx.journal.target = Some(target.clone());
        tx.journal.keep_backup = keep_backup;
        tx.history.set_versions(
            tx.txid(),
            prior.as_ref().map(|p| p.version.as_str()),
            Some(descriptor.version.as_str()),
        );

        if let Some(current) = &prior {
            let in_place = current.digest == descriptor.expected_digest
                && current.install_path == install_path
                && hash::digest_file_if_exists(&install_path)?.as_ref() == Some(&current.digest);
            if in_place && !force {
                info!("{} {} is already installed", name, current.version);
                tx.journal.target = Some(current.clone());
                return Ok(tx.report(TxOutcome::Unchanged, None));
            }
        }

        // Verified -> Staged
        let staging = tx.stage()?;
        let staged_file = staging.join(&descriptor.entry_point);
        let (staged_digest, size) = fsutil::copy_atomic(&artifact.path, &staged_file)?;
        if staged_digest != descriptor.expected_digest {
            return Err(Error::ChecksumMismatch {
                expected: descriptor.expected_digest.to_string(),
                actual: staged_digest.to_string(),
            });
        }
        debug!("Staged {} ({} bytes) at {}", name, size, staged_file.display());
        tx.journal.staged_file = Some(staged_file.clone());
        tx.advance(TxState::Staged)?;

        // Staged -> BackedUp
        if let Some(current) = &prior {
            if let Some(record) = self.backup_if_present(current)? {
                tx.journal.backup_sequence = Some(record.sequence);
                if keep_backup {
                    target.backup = Some(record.reference());
                }
            }
        }
        if untracked {
            let record = self.backup_untracked(name, &install_path)?;
            tx.journal.displaced_backup = Some(record.sequence);
        }
        tx.journal.target = Some(target.clone());
        tx.advance(TxState::BackedUp)?;

        // BackedUp -> Swapped
        fsutil::rename(&staged_file, &install_path)?;
        if let Some(current) = &prior {
            if current.install_path != install_path {
                fsutil::remove_file_if_exists(&current.install_path)?;
            }
        }
        tx.advance(TxState::Swapped)?;

        // Swapped -> Recorded
        manifest.insert(target.clone());
        guard.commit(&manifest)?;
        reconcile::write_marker(&self.layout, &target)?;
        tx.advance(TxState::Recorded)?;

        // Recorded -> Committed
        tx.advance(TxState::Committed)?;
        let retained = self.finalize_commit(&tx.journal);
        info!("Installed {} {} at {}", name, target.version, install_path.display());
        Ok(tx.report(TxOutcome::Committed, retained))
    }

    fn apply_uninstall(
        &self,
        tx: &mut Tx<'_>,
        guard: &mut ManifestGuard<'_>,
        name: &str,
    ) -> Result<TransactionReport> {
        tx.advance(TxState::Requested)?;
        let mut manifest = guard.load()?;
        let prior = manifest
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotInstalled(name.to_string()))?;

        tx.journal.prior = Some(prior.clone());
        tx.journal.keep_backup = true;
        tx.history
            .set_versions(tx.txid(), Some(prior.version.as_str()), None);

        tx.stage()?;
        tx.advance(TxState::Staged)?;

        if let Some(record) = self.backup_if_present(&prior)? {
            tx.journal.backup_sequence = Some(record.sequence);
        }
        tx.advance(TxState::BackedUp)?;

        fsutil::remove_file_if_exists(&prior.install_path)?;
        tx.advance(TxState::Swapped)?;

        manifest.remove(name);
        guard.commit(&manifest)?;
        reconcile::remove_marker(&self.layout, name)?;
        tx.advance(TxState::Recorded)?;

        tx.advance(TxState::Committed)?;
        let retained = self.finalize_commit(&tx.journal);
        info!("Uninstalled {} {}", name, prior.version);
        Ok(tx.report(TxOutcome::Committed, retained))
    }

    fn apply_restore(
        &self,
        tx: &mut Tx<'_>,
        guard: &mut ManifestGuard<'_>,
        name: &str,
    ) -> Result<TransactionReport> {
        tx.advance(TxState::Requested)?;
        let mut manifest = guard.load()?;
        let prior = manifest.get(name).cloned();

        // Prefer the backup the live entry points at
        let referenced = prior
            .as_ref()
            .and_then(|p| p.backup.as_ref())
            .map(|b| self.backups.find(name, b.sequence))
            .transpose()?
            .flatten();
        let record = match referenced {
            Some(record) => record,
            None => self
                .backups
                .latest(name)?
                .ok_or_else(|| Error::NoBackup(name.to_string()))?,
        };

        let mut target = record.entry.clone();
        target.name = name.to_string();
        target.digest = record.file_digest.clone();
        target.backup = None;

        match manifest.owner_of(&target.install_path) {
            Some(owner) if owner.name != name => {
                return Err(Error::PathConflict {
                    path: target.install_path.clone(),
                    owner: owner.name.clone(),
                });
            }
            None if occupied(&target.install_path) => {
                return Err(Error::UntrackedFile {
                    path: target.install_path.clone(),
                });
            }
            _ => {}
        }

        tx.journal.prior = prior.clone();
        tx.journal.target = Some(target.clone());
        tx.journal.consumed_backup = Some(record.sequence);
        tx.history.set_versions(
            tx.txid(),
            prior.as_ref().map(|p| p.version.as_str()),
            Some(target.version.as_str()),
        );

        let stored = hash::digest_file(&record.file)?;
        if stored != record.file_digest {
            return Err(Error::ChecksumMismatch {
                expected: record.file_digest.to_string(),
                actual: stored.to_string(),
            });
        }
        tx.advance(TxState::Verified)?;

        let staging = tx.stage()?;
        let file_name = target
            .install_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(name));
        let staged_file = staging.join(file_name);
        let (staged_digest, _) = fsutil::copy_atomic(&record.file, &staged_file)?;
        if staged_digest != target.digest {
            return Err(Error::ChecksumMismatch {
                expected: target.digest.to_string(),
                actual: staged_digest.to_string(),
            });
        }
        tx.journal.staged_file = Some(staged_file.clone());
        tx.advance(TxState::Staged)?;

        if let Some(current) = &prior {
            if let Some(replaced) = self.backup_if_present(current)? {
                tx.journal.backup_sequence = Some(replaced.sequence);
            }
        }
        tx.advance(TxState::BackedUp)?;

        fsutil::rename(&staged_file, &target.install_path)?;
        if let Some(current) = &prior {
            if current.install_path != target.install_path {
                fsutil::remove_file_if_exists(&current.install_path)?;
            }
        }
        tx.advance(TxState::Swapped)?;

        manifest.insert(target.clone());
        guard.commit(&manifest)?;
        reconcile::write_marker(&self.layout, &target)?;
        tx.advance(TxState::Recorded)?;

        tx.advance(TxState::Committed)?;
        let retained = self.finalize_commit(&tx.journal);
        info!(
            "Restored {} {} from backup #{}",
            name, target.version, record.sequence
        );
        Ok(tx.report(TxOutcome::Committed, retained))
    }

    /// Back up `entry` unless its file is already gone
    fn backup_if_present(
        &self,
        entry: &InstalledPackage,
    ) -> Result<Option<BackupRecord>> {
        if !entry.install_path.exists() {
            warn!(
                "{} is missing; nothing to back up for {}",
                entry.install_path.display(),
                entry.name
            );
            return Ok(None);
        }
        self.backups.backup(entry).map(Some)
    }

    /// Keep a copy of a file no package owns before a forced install replaces it
    fn backup_untracked(&self, name: &str, path: &Path) -> Result<BackupRecord> {
        let digest = hash::digest_file(path)?;
        warn!(
            "Replacing untracked file {} ({}); it is restored if the install fails",
            path.display(),
            digest.short()
        );
        let untracked = InstalledPackage::new(name, UNTRACKED_VERSION, digest, path.to_path_buf());
        self.backups.backup(&untracked)
    }

    /// Turn a transaction result into the caller-visible outcome
    ///
    /// Any failure once `Staged` was reached is rolled back first and surfaces
    /// as `Error::RolledBack`. A simulated crash leaves everything in place
    /// for recovery.
    pub(crate) fn conclude(
        &self,
        mut tx: Tx<'_>,
        guard: Option<&mut ManifestGuard<'_>>,
        result: Result<TransactionReport>,
    ) -> Result<TransactionReport> {
        let txid = tx.journal.txid.clone();
        let cause = match result {
            Ok(report) => {
                tx.history.finish(&txid, ChangesetStatus::Applied, None);
                return Ok(report);
            }
            Err(err @ Error::SimulatedCrash(_)) => {
                warn!("Transaction {} abandoned: {}", txid, err);
                return Err(err);
            }
            Err(cause) => cause,
        };

        if !tx.on_disk {
            tx.history
                .finish(&txid, ChangesetStatus::RolledBack, Some(cause.to_string()));
            return Err(cause);
        }

        let state = tx.journal.state;
        if state < TxState::Staged {
            // Nothing outside the staging directory was touched yet
            if let Err(e) = fsutil::remove_dir_if_exists(&tx.journal.dir(&self.layout)) {
                warn!("Failed to clean up staging for {}: {}", txid, e);
            }
            tx.history
                .finish(&txid, ChangesetStatus::RolledBack, Some(cause.to_string()));
            return Err(cause);
        }

        warn!(
            "{} of {} failed in state {}: {}; rolling back",
            tx.journal.operation, tx.journal.package, state, cause
        );
        let rolled_back = match guard {
            Some(guard) => self.roll_back(guard, &mut tx.journal),
            None => Err(Error::PartialSwapDetected(
                "manifest lock not held during rollback".to_string(),
            )),
        };

        match rolled_back {
            Ok(()) => {
                tx.history
                    .finish(&txid, ChangesetStatus::RolledBack, Some(cause.to_string()));
                Err(Error::RolledBack {
                    state,
                    cause: Box::new(cause),
                })
            }
            Err(rollback_error) => {
                error!("Rollback of {} failed: {}", txid, rollback_error);
                Err(Error::PartialSwapDetected(format!(
                    "transaction {} failed ({}) and rollback failed ({}); it will be retried on the next start",
                    txid, cause, rollback_error
                )))
            }
        }
    }
}
