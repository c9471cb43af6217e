// src/manifest/store.rs

//! Durable, locked access to the manifest file
//!
//! Writers go through [`ManifestStore::lock`] (or
//! [`ManifestStore::with_transaction`]), which holds the advisory lock for the
//! guard's lifetime. Every commit replaces the whole file atomically, so an
//! unlocked [`ManifestStore::snapshot`] always sees some committed state.

use crate::error::{Error, Result};
use crate::fsutil;
use crate::layout::Layout;
use crate::manifest::lock::ManifestLock;
use crate::manifest::reconcile::{self, Discrepancy, ReconcileReport};
use crate::manifest::schema::{self, MANIFEST_SCHEMA_VERSION, Manifest};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Owner of `packages.json`
#[derive(Debug, Clone)]
pub struct ManifestStore {
    layout: Layout,
    lock_timeout: Duration,
}

impl ManifestStore {
    pub fn new(layout: &Layout, lock_timeout: Duration) -> Self {
        Self {
            layout: layout.clone(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.layout.manifest_path()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Load the manifest for a caller that intends to modify it
    ///
    /// A corrupt file is replaced by its reconciliation when every marker
    /// verifies; otherwise `Error::ManifestCorruption` lists what could not
    /// be verified. A manifest from a newer cmam is refused.
    pub fn load(&self) -> Result<Manifest> {
        self.load_checked().map(|(manifest, _)| manifest)
    }

    /// Read the last committed manifest without taking the lock
    ///
    /// Never fails on content: an unreadable or newer-schema file yields the
    /// reconciliation view instead.
    pub fn snapshot(&self) -> Result<Manifest> {
        let Some(bytes) = self.read_raw()? else {
            return Ok(Manifest::new());
        };
        match schema::parse(&bytes) {
            Ok(manifest) => Ok(manifest),
            Err(e @ (Error::ParseError(_) | Error::UnsupportedSchema { .. })) => {
                warn!("Using reconciled view of manifest: {}", e);
                Ok(reconcile::reconcile(&self.layout)?.manifest)
            }
            Err(e) => Err(e),
        }
    }

    /// Take the manifest lock, waiting up to the configured timeout
    pub fn lock(&self) -> Result<ManifestGuard<'_>> {
        let lock = ManifestLock::acquire(&self.layout.manifest_lock_path(), self.lock_timeout)?;
        Ok(ManifestGuard {
            store: self,
            _lock: lock,
            quarantine: false,
        })
    }

    /// Take the lock only if no other process holds it
    pub fn try_lock(&self) -> Result<Option<ManifestGuard<'_>>> {
        let lock = ManifestLock::try_acquire(&self.layout.manifest_lock_path())?;
        Ok(lock.map(|lock| ManifestGuard {
            store: self,
            _lock: lock,
            quarantine: false,
        }))
    }

    /// Load, mutate and commit under the lock
    ///
    /// Nothing is written when `f` fails.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Manifest) -> Result<T>,
    {
        let mut guard = self.lock()?;
        let mut manifest = guard.load()?;
        let value = f(&mut manifest)?;
        guard.commit(&manifest)?;
        Ok(value)
    }

    /// Accept the verifiable subset of a reconciliation, whatever it leaves out
    ///
    /// Markers that did not verify are removed so a later scan converges.
    pub fn repair(&self) -> Result<ReconcileReport> {
        let mut guard = self.lock()?;
        let report = reconcile::reconcile(&self.layout)?;

        for discrepancy in &report.discrepancies {
            match discrepancy {
                Discrepancy::DigestMismatch { name, .. } | Discrepancy::MissingFile { name, .. } => {
                    warn!("Dropping unverifiable record for {}: {}", name, discrepancy);
                    reconcile::remove_marker(&self.layout, name)?;
                }
                Discrepancy::UnreadableMarker { path, .. } => {
                    warn!("Removing {}", path.display());
                    fsutil::remove_file_if_exists(path)?;
                }
                Discrepancy::Untracked { .. } => {}
            }
        }

        guard.quarantine = match self.read_raw()? {
            Some(bytes) => schema::parse(&bytes).is_err(),
            None => false,
        };
        guard.commit(&report.manifest)?;
        info!("Manifest repaired with {} packages", report.manifest.len());
        Ok(report)
    }

    fn read_raw(&self) -> Result<Option<Vec<u8>>> {
        let path = self.path();
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!("Failed to read {}", path.display()), e)),
        }
    }

    /// Returns the manifest and whether the file on disk must be quarantined
    fn load_checked(&self) -> Result<(Manifest, bool)> {
        let Some(bytes) = self.read_raw()? else {
            debug!("No manifest at {}, starting empty", self.path().display());
            return Ok((Manifest::new(), false));
        };

        match schema::parse(&bytes) {
            Ok(manifest) => Ok((manifest, false)),
            Err(Error::ParseError(reason)) => {
                warn!("Manifest {} is corrupt: {}", self.path().display(), reason);
                let report = reconcile::reconcile(&self.layout)?;
                if report.is_clean() {
                    warn!(
                        "Accepted reconciled manifest with {} packages; corrupt file will be quarantined",
                        report.manifest.len()
                    );
                    Ok((report.manifest, true))
                } else {
                    Err(Error::ManifestCorruption {
                        path: self.path(),
                        unresolved: report
                            .unresolved()
                            .into_iter()
                            .map(|d| d.to_string())
                            .collect(),
                    })
                }
            }
            Err(e) => Err(e),
        }
    }

    fn quarantine_path(&self) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        self.layout
            .root()
            .join(format!("packages.json.corrupt-{}", stamp))
    }

    /// Rewrite `packages.txt` only when the user already has one
    fn project_legacy_list(&self, manifest: &Manifest) {
        let path = self.layout.legacy_list_path();
        if !path.exists() {
            return;
        }
        let mut lines = String::new();
        for entry in manifest.iter() {
            lines.push_str(&format!("{}=={}\n", entry.name, entry.version));
        }
        if let Err(e) = fsutil::write_atomic(&path, lines.as_bytes()) {
            warn!("Failed to update {}: {}", path.display(), e);
        }
    }
}

/// Exclusive access to the manifest; the lock is released on drop
#[derive(Debug)]
pub struct ManifestGuard<'a> {
    store: &'a ManifestStore,
    _lock: ManifestLock,
    quarantine: bool,
}

impl ManifestGuard<'_> {
    pub fn load(&mut self) -> Result<Manifest> {
        let (manifest, quarantine) = self.store.load_checked()?;
        self.quarantine |= quarantine;
        Ok(manifest)
    }

    /// Atomically replace the manifest file
    pub fn commit(&mut self, manifest: &Manifest) -> Result<()> {
        let path = self.store.path();

        if let Some(bytes) = self.store.read_raw()? {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                let found = schema::declared_version(&value).unwrap_or(MANIFEST_SCHEMA_VERSION);
                if found > MANIFEST_SCHEMA_VERSION {
                    return Err(Error::UnsupportedSchema {
                        found,
                        supported: MANIFEST_SCHEMA_VERSION,
                    });
                }
            }
            if self.quarantine {
                let target = self.store.quarantine_path();
                warn!("Quarantining corrupt manifest as {}", target.display());
                fsutil::rename(&path, &target)?;
                self.quarantine = false;
            }
        }

        fsutil::write_atomic(&path, &manifest.to_bytes()?)?;
        debug!("Committed manifest with {} packages", manifest.len());

        self.store.project_legacy_list(manifest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use crate::manifest::schema::InstalledPackage;

    fn setup() -> (tempfile::TempDir, Layout, ManifestStore) {
        let temp = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp.path());
        layout.ensure().unwrap();
        let store = ManifestStore::new(&layout, Duration::from_millis(200));
        (temp, layout, store)
    }

    fn entry(layout: &Layout, name: &str, contents: &[u8]) -> InstalledPackage {
        let path = layout.install_path(name);
        fs::write(&path, contents).unwrap();
        InstalledPackage::new(name, "1.0.0", hash::digest(contents), path)
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let (_temp, _layout, store) = setup();
        assert!(store.load().unwrap().is_empty());
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_with_transaction_commits_on_success_only() {
        let (_temp, layout, store) = setup();
        let tool = entry(&layout, "tool", b"tool");

        store
            .with_transaction(|m| {
                m.insert(tool.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(store.snapshot().unwrap().get("tool"), Some(&tool));

        let result: Result<()> = store.with_transaction(|m| {
            m.remove("tool");
            Err(Error::Cancelled)
        });
        assert!(result.is_err());
        assert!(store.snapshot().unwrap().get("tool").is_some());
    }

    #[test]
    fn test_lock_excludes_second_writer() {
        let (_temp, _layout, store) = setup();
        let _guard = store.lock().unwrap();

        let other = store.clone();
        let err = other.with_transaction(|_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::ManifestLocked { .. }));
    }

    #[test]
    fn test_corrupt_manifest_reconciles_when_markers_verify() {
        let (_temp, layout, store) = setup();
        let tool = entry(&layout, "tool", b"tool");
        reconcile::write_marker(&layout, &tool).unwrap();
        fs::write(store.path(), b"{ truncated").unwrap();

        let mut guard = store.lock().unwrap();
        let manifest = guard.load().unwrap();
        assert_eq!(manifest.get("tool").map(|e| &e.digest), Some(&tool.digest));
        guard.commit(&manifest).unwrap();
        drop(guard);

        let quarantined = fs::read_dir(layout.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("packages.json.corrupt-")
            })
            .count();
        assert_eq!(quarantined, 1);
        assert!(store.load().is_ok());
    }

    #[test]
    fn test_corrupt_manifest_with_bad_marker_is_an_error() {
        let (_temp, layout, store) = setup();
        let tool = entry(&layout, "tool", b"tool");
        reconcile::write_marker(&layout, &tool).unwrap();
        fs::write(&tool.install_path, b"tampered").unwrap();
        fs::write(store.path(), b"garbage").unwrap();

        match store.load() {
            Err(Error::ManifestCorruption { unresolved, .. }) => assert_eq!(unresolved.len(), 1),
            other => panic!("unexpected: {:?}", other),
        }

        // Read-only callers still get a view
        assert!(store.snapshot().unwrap().is_empty());

        let report = store.repair().unwrap();
        assert_eq!(report.unresolved().len(), 1);
        assert!(store.load().unwrap().is_empty());
        assert!(reconcile::read_marker(&layout, "tool").is_none());
    }

    #[test]
    fn test_future_schema_refuses_writes() {
        let (_temp, layout, store) = setup();
        fs::write(store.path(), br#"{"schemaVersion": 7, "packages": {}}"#).unwrap();

        assert!(matches!(
            store.load(),
            Err(Error::UnsupportedSchema { found: 7, .. })
        ));
        let mut guard = store.lock().unwrap();
        assert!(matches!(
            guard.commit(&Manifest::new()),
            Err(Error::UnsupportedSchema { .. })
        ));
        drop(guard);

        let tool = entry(&layout, "tool", b"tool");
        reconcile::write_marker(&layout, &tool).unwrap();
        assert!(store.snapshot().unwrap().get("tool").is_some());
    }

    #[test]
    fn test_legacy_list_only_updated_when_present() {
        let (_temp, layout, store) = setup();
        let tool = entry(&layout, "tool", b"tool");

        store
            .with_transaction(|m| {
                m.insert(tool.clone());
                Ok(())
            })
            .unwrap();
        assert!(!layout.legacy_list_path().exists());

        fs::write(layout.legacy_list_path(), "").unwrap();
        store.with_transaction(|_| Ok(())).unwrap();
        assert_eq!(
            fs::read_to_string(layout.legacy_list_path()).unwrap(),
            "tool==1.0.0\n"
        );
    }
}
