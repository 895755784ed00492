//! SQLite persistence for the staging area, version history, secret vault
//! and audit log.
//!
//! All four tables live in one database file (`<state_dir>/mtastage.db`).
//! The connection sits behind a mutex that is held only for a single store
//! call or transaction, so readers never wait on a whole apply.

pub mod audit;
pub mod staging;
pub mod versions;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, StageError};

pub use audit::{AuditEntry, AuditLog};
pub use staging::{StagedDiff, StagedEntry, StagingStore};
pub use versions::{ConfigVersion, VersionStatus, VersionStore, VersionSummary};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS staged_changes (
    key                 TEXT PRIMARY KEY,
    value               TEXT,
    category            TEXT NOT NULL,
    staged_by_user      TEXT NOT NULL,
    staged_by_username  TEXT NOT NULL,
    staged_at           TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config_versions (
    version_number  INTEGER PRIMARY KEY AUTOINCREMENT,
    full_content    TEXT NOT NULL,
    parameters_json TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    created_by      TEXT NOT NULL,
    applied_at      TEXT,
    applied_by      TEXT,
    status          TEXT NOT NULL CHECK (status IN ('draft', 'applied', 'rolled_back')),
    notes           TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS config_versions_one_applied
    ON config_versions (status) WHERE status = 'applied';

CREATE TABLE IF NOT EXISTS secrets (
    name            TEXT PRIMARY KEY,
    encrypted_value BLOB NOT NULL,
    updated_at      TEXT NOT NULL,
    updated_by      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT NOT NULL,
    operation   TEXT NOT NULL,
    actor       TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    details     TEXT
);
";

/// Who made a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Editor {
    pub user_id: String,
    pub username: String,
}

impl Editor {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// Shared handle to the engine database.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path` and make sure every table exists.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Secrets and audit live here; owner-only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// In-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // rusqlite rolls back an unfinished transaction on drop, so a
        // poisoned guard still holds a consistent connection.
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run `f` with the connection held.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside a transaction that commits only if `f` succeeds.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

// ── Timestamp helpers shared by the stores ───────────────────────────

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn to_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub(crate) fn serialization(e: serde_json::Error) -> StageError {
    StageError::SerializationError(e.to_string())
}
