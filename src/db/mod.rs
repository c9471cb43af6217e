// src/db/mod.rs

//! Database layer for cmam
//!
//! SQLite holds the bookkeeping that is not the source of truth for what is
//! installed:
//! - Changeset history for every transaction (`cmam history`)
//! - The cache index (size and last access per cached artifact)
//!
//! The manifest file remains the only record of installed state.

pub mod models;
pub mod schema;

use crate::error::{Error, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use tracing::debug;

/// Open the database, creating it and applying migrations if needed
///
/// This is idempotent - calling it on an existing database is safe.
///
/// # Arguments
///
/// * `db_path` - Path where the database lives
pub fn init(db_path: &Path) -> Result<Connection> {
    debug!("Opening database at: {}", db_path.display());

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::io("Failed to create database directory", e))?;
    }

    let conn = Connection::open(db_path)?;

    // Concurrent cmam invocations share this file; WAL plus a busy timeout
    // keeps a second writer waiting instead of failing.
    conn.execute_batch(
        "
        PRAGMA busy_timeout = 5000;
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        ",
    )?;

    schema::migrate(&conn)?;
    Ok(conn)
}

/// Run `f` inside a SQLite transaction, committing only on success
///
/// The transaction is immediate: it takes the write lock up front, so a
/// second cmam process waits on `busy_timeout` rather than failing halfway.
pub fn transaction<F, T>(conn: &Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_creates_database() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("cmam.db");

        let result = init(&db_path);
        assert!(result.is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_init_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("cmam.db");

        init(&db_path).unwrap();
        let conn = init(&db_path).unwrap();
        assert_eq!(schema::get_schema_version(&conn).unwrap(), schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let conn = init(&temp_dir.path().join("cmam.db")).unwrap();

        let result: Result<()> = transaction(&conn, |tx| {
            tx.execute(
                "INSERT INTO cache_entries (digest, size, last_access) VALUES ('abc', 1, 'now')",
                [],
            )?;
            Err(Error::IoError("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
