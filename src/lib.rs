// src/lib.rs

//! cmam: a local application manager
//!
//! Installs single-file programs from a registry into one directory on the
//! user's PATH, with atomic operations, backups and crash recovery.
//!
//! # Architecture
//!
//! - Manifest-first: `packages.json` is the only record of what is installed
//! - Transactions: every mutation is journaled and either commits or rolls back
//! - Content-addressed cache: artifacts are keyed by their verified SHA-256
//! - Two-phase self-update: cmam replaces its own binary on the next launch
//! - SQLite holds history and the cache index, never installed state

pub mod backup;
pub mod cache;
pub mod config;
pub mod db;
pub mod doctor;
pub mod download;
mod error;
mod fsutil;
pub mod hash;
pub mod layout;
pub mod manifest;
pub mod package;
pub mod registry;
pub mod search_path;
pub mod transaction;

pub use error::{Error, Outcome, Result};
