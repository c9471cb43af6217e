// src/transaction/mod.rs

//! The install/update/uninstall/self-update transaction engine
//!
//! Every mutating request runs as a transaction through these states:
//!
//! ```text
//! Requested -> Fetching -> Verified -> Staged -> BackedUp -> Swapped -> Recorded -> Committed
//!                                         \________ failure ________/
//!                                                    |
//!                                               RollingBack -> Failed
//! ```
//!
//! Resolution and download happen without the manifest lock. From `Staged`
//! onwards the lock is held and a journal in the staging directory records
//! the last state reached, so a crash at any point is resolved by
//! [`TransactionEngine::recover`] on the next start.
//!
//! - [`journal`]: the on-disk transaction record
//! - [`engine`]: install, update, uninstall and restore
//! - [`recovery`]: rollback, roll-forward and startup recovery
//! - [`self_update`]: the two-phase replacement of cmam's own binary

pub mod engine;
mod history;
pub mod journal;
pub mod recovery;
pub mod self_update;

use crate::backup::BackupManager;
use crate::cache::CacheStore;
use crate::config::Settings;
use crate::download::{Downloader, Fetcher};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::manifest::ManifestStore;
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub use journal::Journal;
pub use recovery::RecoveryReport;
pub use self_update::{PendingSwap, SELF_PACKAGE, SwapOutcome};

/// Transaction states, in the order a successful transaction visits them
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Requested,
    Fetching,
    Verified,
    Staged,
    BackedUp,
    Swapped,
    Recorded,
    Committed,
    RollingBack,
    Failed,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Requested => "requested",
            TxState::Fetching => "fetching",
            TxState::Verified => "verified",
            TxState::Staged => "staged",
            TxState::BackedUp => "backed_up",
            TxState::Swapped => "swapped",
            TxState::Recorded => "recorded",
            TxState::Committed => "committed",
            TxState::RollingBack => "rolling_back",
            TxState::Failed => "failed",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Install,
    Update,
    Uninstall,
    Restore,
    SelfUpdate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Install => "install",
            Operation::Update => "update",
            Operation::Uninstall => "uninstall",
            Operation::Restore => "restore",
            Operation::SelfUpdate => "self_update",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "install" => Ok(Operation::Install),
            "update" => Ok(Operation::Update),
            "uninstall" => Ok(Operation::Uninstall),
            "restore" => Ok(Operation::Restore),
            "self_update" => Ok(Operation::SelfUpdate),
            _ => Err(format!("Invalid operation: {}", s)),
        }
    }
}

/// Cooperative cancellation, checked at every state transition
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What an injected fault does when its state is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail as if the step had errored; the engine rolls back
    Fail,
    /// Stop dead without any cleanup, as if the process were killed
    Crash,
}

/// Faults to inject, keyed by the state at which they fire
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    faults: HashMap<TxState, Fault>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, state: TxState, fault: Fault) -> Self {
        self.faults.insert(state, fault);
        self
    }

    fn get(&self, state: TxState) -> Option<Fault> {
        self.faults.get(&state).copied()
    }
}

/// How a successful transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    /// The requested artifact was already installed
    Unchanged,
    /// Staged for completion on the next launch (self-update)
    Pending,
}

/// Result of one successful transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReport {
    pub txid: String,
    pub operation: Operation,
    pub package: String,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub outcome: TxOutcome,
    pub install_path: Option<PathBuf>,
    /// Backup retained by this transaction
    pub backup: Option<u64>,
}

/// Drives transactions against one cmam root
pub struct TransactionEngine {
    layout: Layout,
    store: ManifestStore,
    registry: Box<dyn Registry>,
    downloader: Downloader,
    backups: BackupManager,
    retention: usize,
    self_exe: Option<PathBuf>,
    cancel: CancelFlag,
    faults: FaultPlan,
}

impl TransactionEngine {
    pub fn new(
        layout: Layout,
        settings: &Settings,
        registry: Box<dyn Registry>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        layout.ensure()?;
        let store = ManifestStore::new(&layout, settings.lock_timeout());
        let downloader = Downloader::new(
            fetcher,
            CacheStore::new(&layout),
            settings.retry_policy(),
        );
        let backups = BackupManager::new(&layout);

        Ok(Self {
            layout,
            store,
            registry,
            downloader,
            backups,
            retention: settings.backup_retention,
            self_exe: None,
            cancel: CancelFlag::new(),
            faults: FaultPlan::new(),
        })
    }

    /// Treat `path` as cmam's own executable
    pub fn with_self_exe(mut self, path: impl Into<PathBuf>) -> Self {
        self.self_exe = Some(path.into());
        self
    }

    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = flag;
        self
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    fn self_exe(&self) -> Result<PathBuf> {
        match &self.self_exe {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe()
                .map_err(|e| Error::io("Failed to locate the running cmam executable", e)),
        }
    }

    /// Cancellation and fault injection, evaluated on entering `state`
    ///
    /// Once committed, only a simulated crash can still fire.
    fn checkpoint(&self, state: TxState) -> Result<()> {
        let committed = state == TxState::Committed;
        if !committed && self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.faults.get(state) {
            Some(Fault::Crash) => Err(Error::SimulatedCrash(state)),
            Some(Fault::Fail) if !committed => Err(Error::InjectedFault(state)),
            _ => Ok(()),
        }
    }
}

static TX_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique, sortable transaction id
pub(crate) fn new_txid() -> String {
    format!(
        "{}-{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        std::process::id(),
        TX_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order_follows_lifecycle() {
        assert!(TxState::Requested < TxState::Staged);
        assert!(TxState::Staged < TxState::Swapped);
        assert!(TxState::Recorded < TxState::Committed);
        assert_eq!(TxState::BackedUp.to_string(), "backed_up");
    }

    #[test]
    fn test_operation_round_trips_through_str() {
        for op in [
            Operation::Install,
            Operation::Update,
            Operation::Uninstall,
            Operation::Restore,
            Operation::SelfUpdate,
        ] {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!("build".parse::<Operation>().is_err());
    }

    #[test]
    fn test_txids_are_unique() {
        let a = new_txid();
        let b = new_txid();
        assert_ne!(a, b);
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
