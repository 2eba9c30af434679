//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees
//! that migrations are run before any other operation. The server keeps one
//! handle behind an async mutex; multi-statement operations use
//! `unchecked_transaction` so they commit or roll back as a unit.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default application database in the
    /// platform-appropriate data directory.
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("net", "parley", "parley").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("parley.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    ///
    /// Used by the server when `DATABASE_PATH` is configured, and by tests.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Path helper for callers that want the default location without
    /// opening the database.
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("net", "parley", "parley").ok_or(StoreError::NoDataDir)?;
        Ok(project_dirs.data_dir().join("parley.db"))
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers shared by the per-entity modules
// ---------------------------------------------------------------------------

pub(crate) fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(idx, &v)).transpose()
}

/// Map a TEXT enum column through `parse`, failing the row on unknown values.
pub(crate) fn parse_kind<T>(
    idx: usize,
    s: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown enum value: {s}").into(),
        )
    })
}

/// True when an execute failed on a UNIQUE / CHECK constraint.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
