// src/transaction/history.rs

//! Best-effort changeset history
//!
//! The history database is a convenience for `cmam history`; the manifest and
//! journals are authoritative. Every failure here is logged and swallowed so
//! it can never change a transaction's outcome.

use crate::db;
use crate::db::models::{Changeset, ChangesetStatus};
use crate::error::Result;
use crate::layout::Layout;
use crate::transaction::Operation;
use chrono::{NaiveDateTime, Utc};
use rusqlite::Connection;
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) struct History {
    conn: Option<Connection>,
}

impl History {
    pub(crate) fn open(layout: &Layout) -> Self {
        match db::init(&layout.database_path()) {
            Ok(conn) => Self { conn: Some(conn) },
            Err(e) => {
                warn!("History unavailable: {}", e);
                Self { conn: None }
            }
        }
    }

    fn with<T>(&self, what: &str, f: impl FnOnce(&Connection) -> Result<T>) -> Option<T> {
        let conn = self.conn.as_ref()?;
        match db::transaction(conn, |tx| f(tx)) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to {} in history: {}", what, e);
                None
            }
        }
    }

    pub(crate) fn start(&self, txid: &str, operation: Operation, package: &str) {
        self.with("record transaction", |conn| {
            Changeset::new(txid.to_string(), operation, package.to_string()).insert(conn)
        });
    }

    pub(crate) fn set_versions(&self, txid: &str, from: Option<&str>, to: Option<&str>) {
        self.with("record versions", |conn| {
            if let Some(mut changeset) = Changeset::find_by_txid(conn, txid)? {
                changeset.from_version = from.map(str::to_string);
                changeset.to_version = to.map(str::to_string);
                changeset.set_versions(conn)?;
            }
            Ok(())
        });
    }

    pub(crate) fn finish(&self, txid: &str, status: ChangesetStatus, error: Option<String>) {
        self.with("finish transaction", |conn| {
            if let Some(mut changeset) = Changeset::find_by_txid(conn, txid)? {
                changeset.finish(conn, status, error)?;
            }
            Ok(())
        });
    }

    /// Mark pending changesets older than `age` as rolled back
    ///
    /// Those belong to invocations that died before touching the install
    /// root, so there is nothing to undo.
    pub(crate) fn expire_pending(&self, age: Duration) -> usize {
        self.with("expire pending transactions", |conn| {
            let cutoff = Utc::now().naive_utc()
                - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero());
            let mut expired = 0;
            for mut changeset in Changeset::find_by_status(conn, ChangesetStatus::Pending)? {
                let stale = changeset
                    .created_at
                    .as_deref()
                    .and_then(|t| NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S").ok())
                    .is_some_and(|created| created < cutoff);
                if stale {
                    debug!("Expiring abandoned transaction {}", changeset.txid);
                    changeset.finish(
                        conn,
                        ChangesetStatus::RolledBack,
                        Some("interrupted before staging".to_string()),
                    )?;
                    expired += 1;
                }
            }
            Ok(expired)
        })
        .unwrap_or(0)
    }
}
