// src/transaction/journal.rs

//! Per-transaction journal
//!
//! `journal.json` lives in the transaction's staging directory and is
//! atomically rewritten on every state change from `Staged` on. Its presence
//! means a transaction touched the install root and has not finished; its
//! contents say enough to restore the prior state or finish the commit.

use crate::error::{Error, Result};
use crate::fsutil;
use crate::layout::Layout;
use crate::manifest::InstalledPackage;
use crate::transaction::{Operation, TxState};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const JOURNAL_FILE: &str = "journal.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Journal {
    pub txid: String,
    pub operation: Operation,
    pub package: String,
    /// Last state reached
    pub state: TxState,
    /// Manifest entry before the transaction
    pub prior: Option<InstalledPackage>,
    /// Manifest entry the transaction records; `None` removes the package
    pub target: Option<InstalledPackage>,
    pub staged_file: Option<PathBuf>,
    /// Backup of `prior` taken by this transaction
    pub backup_sequence: Option<u64>,
    /// Backup of an untracked file a forced install replaced
    #[serde(default)]
    pub displaced_backup: Option<u64>,
    /// Backup this transaction restores from (consumed on commit)
    pub consumed_backup: Option<u64>,
    /// Keep this transaction's backup after commit
    pub keep_backup: bool,
    pub started_at: String,
    pub updated_at: String,
}

impl Journal {
    pub fn new(txid: &str, operation: Operation, package: &str) -> Self {
        let now = now();
        Self {
            txid: txid.to_string(),
            operation,
            package: package.to_string(),
            state: TxState::Requested,
            prior: None,
            target: None,
            staged_file: None,
            backup_sequence: None,
            displaced_backup: None,
            consumed_backup: None,
            keep_backup: false,
            started_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn dir(&self, layout: &Layout) -> PathBuf {
        layout.staging_dir(&self.txid)
    }

    /// Atomically persist the journal
    pub fn write(&mut self, layout: &Layout) -> Result<()> {
        self.updated_at = now();
        let bytes = serde_json::to_vec_pretty(self)?;
        fsutil::write_atomic(&self.dir(layout).join(JOURNAL_FILE), &bytes)
    }

    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(JOURNAL_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(format!("Failed to read {}", path.display()), e)),
        };
        let mut journal: Journal = serde_json::from_slice(&bytes)
            .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))?;

        let name = journal.package.clone();
        for entry in [&mut journal.prior, &mut journal.target].into_iter().flatten() {
            entry.name = name.clone();
        }
        Ok(Some(journal))
    }

    /// Every staging directory with whatever journal it holds
    pub fn scan(layout: &Layout) -> Result<Vec<(PathBuf, Result<Option<Journal>>)>> {
        let root = layout.staging_root();
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(format!("Failed to list {}", root.display()), e)),
        };

        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        Ok(dirs
            .into_iter()
            .map(|dir| {
                let journal = Self::load(&dir);
                (dir, journal)
            })
            .collect())
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
