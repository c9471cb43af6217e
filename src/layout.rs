// src/layout.rs

//! On-disk layout of a cmam root
//!
//! ```text
//! <root>/
//!   packages.json        manifest (source of truth)
//!   manifest.lock        advisory lock guarding manifest mutation
//!   pending-swap.json    self-update marker
//!   config.json          optional settings
//!   cmam.db              history journal and cache index
//!   packages.txt         legacy projection, only if already present
//!   scripts/             install root (on PATH)
//!     .cmam-staging/     per-transaction staging + journals
//!   markers/             per-package install markers for reconciliation
//!   backups/<name>/<seq>/
//!   .cache/              content-addressed artifacts
//!     tmp/               in-flight downloads
//! ```

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory name of the default root under the user's home
pub const DEFAULT_ROOT_NAME: &str = ".cmam";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.cmam`
    pub fn default_root() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(DEFAULT_ROOT_NAME))
            .ok_or_else(|| Error::Config("Could not determine the home directory".to_string()))
    }

    /// Create every directory the stores expect
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.scripts_dir(),
            self.staging_root(),
            self.markers_dir(),
            self.backups_dir(),
            self.cache_dir(),
            self.cache_tmp_dir(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| Error::io(format!("Failed to create directory {}", dir.display()), e))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("packages.json")
    }

    pub fn manifest_lock_path(&self) -> PathBuf {
        self.root.join("manifest.lock")
    }

    pub fn pending_swap_path(&self) -> PathBuf {
        self.root.join("pending-swap.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join("cmam.db")
    }

    pub fn legacy_list_path(&self) -> PathBuf {
        self.root.join("packages.txt")
    }

    /// The install root that gets registered on PATH
    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }

    /// Staging lives inside the install root so the final move is a rename
    pub fn staging_root(&self) -> PathBuf {
        self.scripts_dir().join(".cmam-staging")
    }

    pub fn staging_dir(&self, txid: &str) -> PathBuf {
        self.staging_root().join(txid)
    }

    pub fn markers_dir(&self) -> PathBuf {
        self.root.join("markers")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(".cache")
    }

    pub fn cache_tmp_dir(&self) -> PathBuf {
        self.cache_dir().join("tmp")
    }

    pub fn install_path(&self, entry_point: &str) -> PathBuf {
        self.scripts_dir().join(entry_point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_creates_tree() {
        let temp = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp.path().join("root"));
        layout.ensure().unwrap();

        assert!(layout.scripts_dir().is_dir());
        assert!(layout.staging_root().is_dir());
        assert!(layout.cache_tmp_dir().is_dir());
        assert!(layout.backups_dir().is_dir());
        assert!(layout.markers_dir().is_dir());

        // Idempotent
        layout.ensure().unwrap();
    }

    #[test]
    fn test_staging_is_inside_install_root() {
        let layout = Layout::new("/tmp/cmam-root");
        assert!(layout.staging_dir("tx1").starts_with(layout.scripts_dir()));
        assert_eq!(
            layout.install_path("tool.exe"),
            PathBuf::from("/tmp/cmam-root/scripts/tool.exe")
        );
    }
}
