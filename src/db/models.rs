// src/db/models.rs

//! Data models for cmam database entities
//!
//! Rust structs that correspond to database tables, with methods for
//! creating, reading, updating, and deleting records.

use crate::error::Result;
use crate::transaction::Operation;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

/// Changeset status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangesetStatus {
    Pending,
    Applied,
    RolledBack,
}

impl ChangesetStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ChangesetStatus::Pending => "pending",
            ChangesetStatus::Applied => "applied",
            ChangesetStatus::RolledBack => "rolled_back",
        }
    }
}

impl FromStr for ChangesetStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangesetStatus::Pending),
            "applied" => Ok(ChangesetStatus::Applied),
            "rolled_back" => Ok(ChangesetStatus::RolledBack),
            _ => Err(format!("Invalid changeset status: {}", s)),
        }
    }
}

/// A Changeset is the history record of one transaction
#[derive(Debug, Clone)]
pub struct Changeset {
    pub id: Option<i64>,
    pub txid: String,
    pub operation: Operation,
    pub package: String,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub status: ChangesetStatus,
    pub error: Option<String>,
    pub created_at: Option<String>,
    pub finished_at: Option<String>,
}

const CHANGESET_COLUMNS: &str = "id, txid, operation, package, from_version, to_version, status, error, created_at, finished_at";

impl Changeset {
    /// Create a new pending Changeset
    pub fn new(txid: String, operation: Operation, package: String) -> Self {
        Self {
            id: None,
            txid,
            operation,
            package,
            from_version: None,
            to_version: None,
            status: ChangesetStatus::Pending,
            error: None,
            created_at: None,
            finished_at: None,
        }
    }

    /// Insert this changeset into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO changesets (txid, operation, package, from_version, to_version, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &self.txid,
                self.operation.as_str(),
                &self.package,
                &self.from_version,
                &self.to_version,
                self.status.as_str(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a changeset by transaction id
    pub fn find_by_txid(conn: &Connection, txid: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM changesets WHERE txid = ?1",
            CHANGESET_COLUMNS
        ))?;

        let changeset = stmt.query_row([txid], Self::from_row).optional()?;

        Ok(changeset)
    }

    /// List all changesets, newest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM changesets ORDER BY id DESC",
            CHANGESET_COLUMNS
        ))?;

        let changesets = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(changesets)
    }

    /// List changesets for one package, newest first
    pub fn find_by_package(conn: &Connection, package: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM changesets WHERE package = ?1 ORDER BY id DESC",
            CHANGESET_COLUMNS
        ))?;

        let changesets = stmt
            .query_map([package], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(changesets)
    }

    /// List changesets with the given status, oldest first
    pub fn find_by_status(conn: &Connection, status: ChangesetStatus) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM changesets WHERE status = ?1 ORDER BY id",
            CHANGESET_COLUMNS
        ))?;

        let changesets = stmt
            .query_map([status.as_str()], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(changesets)
    }

    /// Record the resolved versions once they are known
    pub fn set_versions(&mut self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE changesets SET from_version = ?1, to_version = ?2 WHERE txid = ?3",
            params![&self.from_version, &self.to_version, &self.txid],
        )?;
        Ok(())
    }

    /// Move the changeset to a final status
    pub fn finish(
        &mut self,
        conn: &Connection,
        status: ChangesetStatus,
        error: Option<String>,
    ) -> Result<()> {
        conn.execute(
            "UPDATE changesets SET status = ?1, error = ?2, finished_at = CURRENT_TIMESTAMP
             WHERE txid = ?3",
            params![status.as_str(), &error, &self.txid],
        )?;
        self.status = status;
        self.error = error;
        Ok(())
    }

    /// Convert a database row to a Changeset
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let operation_str: String = row.get(2)?;
        let operation = operation_str.parse::<Operation>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        let status_str: String = row.get(6)?;
        let status = status_str.parse::<ChangesetStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            id: Some(row.get(0)?),
            txid: row.get(1)?,
            operation,
            package: row.get(3)?,
            from_version: row.get(4)?,
            to_version: row.get(5)?,
            status,
            error: row.get(7)?,
            created_at: row.get(8)?,
            finished_at: row.get(9)?,
        })
    }
}

/// Index row for one cached artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub digest: String,
    pub size: i64,
    pub last_access: String,
}

impl CacheRecord {
    pub fn new(digest: String, size: i64, last_access: String) -> Self {
        Self {
            digest,
            size,
            last_access,
        }
    }

    /// Insert or refresh this record
    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO cache_entries (digest, size, last_access) VALUES (?1, ?2, ?3)
             ON CONFLICT(digest) DO UPDATE SET size = excluded.size, last_access = excluded.last_access",
            params![&self.digest, &self.size, &self.last_access],
        )?;
        Ok(())
    }

    /// Update the last access time
    pub fn touch(conn: &Connection, digest: &str, last_access: &str) -> Result<()> {
        conn.execute(
            "UPDATE cache_entries SET last_access = ?1 WHERE digest = ?2",
            params![last_access, digest],
        )?;
        Ok(())
    }

    pub fn find(conn: &Connection, digest: &str) -> Result<Option<Self>> {
        let mut stmt = conn
            .prepare("SELECT digest, size, last_access FROM cache_entries WHERE digest = ?1")?;

        let record = stmt.query_row([digest], Self::from_row).optional()?;

        Ok(record)
    }

    /// All records, least recently used first
    pub fn list_lru(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT digest, size, last_access FROM cache_entries ORDER BY last_access ASC, digest",
        )?;

        let records = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    pub fn delete(conn: &Connection, digest: &str) -> Result<()> {
        conn.execute("DELETE FROM cache_entries WHERE digest = ?1", [digest])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            digest: row.get(0)?,
            size: row.get(1)?,
            last_access: row.get(2)?,
        })
    }
}
