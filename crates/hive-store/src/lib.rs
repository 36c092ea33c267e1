//! Relational store for the platform: bots, users, sessions, content blocks,
//! catalog entities, recovery state, payments, credits, and trackers.
//!
//! Wraps a single SQLite connection in a `Mutex`. Every repository method is
//! synchronous and short; workers call them between awaits.

pub mod db;
pub mod error;
pub mod types;

pub mod blocks;
pub mod bots;
pub mod catalog;
pub mod credits;
pub mod media_cache;
pub mod payments;
pub mod recovery;
pub mod sessions;
pub mod trackers;
pub mod users;

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

pub use error::{Result, StoreError};

pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and initialise the
    /// schema.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path).map_err(StoreError::Database)?;
        db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::Database)?;
        db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap()
    }

    /// Liveness probe for /health.
    pub fn ping(&self) -> Result<()> {
        self.conn()
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(StoreError::from)
    }
}

pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn parse_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_ts_opt(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(idx, v)).transpose()
}
