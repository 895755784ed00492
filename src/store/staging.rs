//! Staging store: pending parameter changes not yet applied.
//!
//! One row per key; staging the same key again replaces the value and its
//! attribution.  Values reaching this store have already been validated.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{now_rfc3339, parse_timestamp, Editor};
use crate::errors::Result;
use crate::schema::{self, Category, StagedValue};

/// A pending change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedEntry {
    pub key: String,
    pub value: StagedValue,
    pub category: Category,
    pub staged_by_user: String,
    pub staged_by_username: String,
    pub staged_at: DateTime<Utc>,
}

/// A staged value that differs from the live one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedDiff {
    pub key: String,
    pub category: Category,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Staging table view over a connection or transaction.
pub struct StagingStore<'c> {
    conn: &'c Connection,
}

const COLUMNS: &str = "key, value, category, staged_by_user, staged_by_username, staged_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<StagedEntry> {
    let value: Option<String> = row.get(1)?;
    let category: String = row.get(2)?;
    let staged_at: String = row.get(5)?;
    Ok(StagedEntry {
        key: row.get(0)?,
        value: value.map_or(StagedValue::Unset, StagedValue::Set),
        category: category.parse().map_err(|e: crate::errors::StageError| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                e.to_string().into(),
            )
        })?,
        staged_by_user: row.get(3)?,
        staged_by_username: row.get(4)?,
        staged_at: parse_timestamp(5, &staged_at)?,
    })
}

impl<'c> StagingStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Upsert by key.  `Unset` is stored as SQL NULL.
    pub fn stage(
        &self,
        key: &str,
        value: &StagedValue,
        category: Category,
        editor: &Editor,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO staged_changes (key, value, category, staged_by_user, staged_by_username, staged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                category = excluded.category,
                staged_by_user = excluded.staged_by_user,
                staged_by_username = excluded.staged_by_username,
                staged_at = excluded.staged_at",
            params![
                key,
                value.as_set(),
                category.as_str(),
                editor.user_id,
                editor.username,
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<StagedEntry>> {
        let sql = format!("SELECT {COLUMNS} FROM staged_changes WHERE key = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![key], entry_from_row)
            .optional()?)
    }

    /// Every pending change, ordered by category then key.
    pub fn list(&self) -> Result<Vec<StagedEntry>> {
        let sql = format!("SELECT {COLUMNS} FROM staged_changes ORDER BY category, key");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], entry_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM staged_changes", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    /// Keys whose staged value differs from `current(key)`, in `list()` order.
    ///
    /// `current` returns the live value in UI form, or `None` when the key
    /// is absent.  Secret-bearing keys are stored as placeholders, so they
    /// are always reported.
    pub fn diff<F>(&self, current: F) -> Result<Vec<StagedDiff>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut out = Vec::new();
        for entry in self.list()? {
            let old_value = current(&entry.key);
            let new_value = entry.value.as_set().map(str::to_string);
            let secret = schema::lookup(&entry.key).is_some_and(|s| s.secret);
            if secret || old_value != new_value {
                out.push(StagedDiff {
                    key: entry.key,
                    category: entry.category,
                    old_value,
                    new_value,
                });
            }
        }
        Ok(out)
    }

    /// Remove exactly the entries that were applied, leaving any key that
    /// was re-staged in the meantime.  Returns how many were removed.
    pub fn clear_applied(&self, applied: &[StagedEntry]) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare("DELETE FROM staged_changes WHERE key = ?1 AND staged_at = ?2")?;
        let mut removed = 0;
        for entry in applied {
            removed += stmt.execute(params![entry.key, entry.staged_at.to_rfc3339()])?;
        }
        Ok(removed)
    }

    /// Drop every pending change.  Returns how many were removed.
    pub fn discard_all(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM staged_changes", [])?)
    }
}
