// src/manifest/mod.rs

//! The manifest: cmam's record of what is installed
//!
//! - [`schema`]: document format, versioning and migrations
//! - [`store`]: atomic, locked reads and writes of `packages.json`
//! - [`lock`]: the advisory lock serializing writers
//! - [`reconcile`]: rebuilding state from install markers after corruption

pub mod lock;
pub mod reconcile;
pub mod schema;
pub mod store;

pub use lock::ManifestLock;
pub use reconcile::{Discrepancy, InstallMarker, ReconcileReport};
pub use schema::{BackupRef, InstalledPackage, MANIFEST_SCHEMA_VERSION, Manifest};
pub use store::{ManifestGuard, ManifestStore};
