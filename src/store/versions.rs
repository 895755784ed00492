//! Version store: append-only history of full configuration snapshots.
//!
//! Version numbers come from one global sequence assigned at creation, so
//! drafts and applied snapshots share a numbering space.  Content never
//! changes after insert; only status and the `applied_*` columns do.
//! At most one row is `applied`, enforced both by `mark_applied` and by a
//! partial unique index.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{now_rfc3339, parse_timestamp, serialization, to_i64, Editor};
use crate::errors::{Result, StageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    Applied,
    RolledBack,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Draft => "draft",
            VersionStatus::Applied => "applied",
            VersionStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionStatus {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(VersionStatus::Draft),
            "applied" => Ok(VersionStatus::Applied),
            "rolled_back" => Ok(VersionStatus::RolledBack),
            other => Err(StageError::SerializationError(format!(
                "unknown version status '{other}'"
            ))),
        }
    }
}

/// A full configuration snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigVersion {
    pub version_number: i64,
    pub full_content: String,
    /// Managed parameters at this version, secrets masked.
    pub parameters: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub applied_at: Option<DateTime<Utc>>,
    pub applied_by: Option<String>,
    pub status: VersionStatus,
    pub notes: Option<String>,
}

/// History listing row (no content).
#[derive(Debug, Clone, Serialize)]
pub struct VersionSummary {
    pub version_number: i64,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub applied_at: Option<DateTime<Utc>>,
    pub applied_by: Option<String>,
    pub status: VersionStatus,
    pub notes: Option<String>,
}

fn status_from_row(row: &Row<'_>, column: usize) -> rusqlite::Result<VersionStatus> {
    let raw: String = row.get(column)?;
    raw.parse().map_err(|e: StageError| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

fn optional_timestamp(column: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(column, &v)).transpose()
}

pub struct VersionStore<'c> {
    conn: &'c Connection,
}

impl<'c> VersionStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Insert a new `draft` snapshot and return its version number.
    pub fn create_draft(
        &self,
        full_content: &str,
        parameters: &BTreeMap<String, String>,
        author: &Editor,
        notes: Option<&str>,
    ) -> Result<i64> {
        let parameters_json = serde_json::to_string(parameters).map_err(serialization)?;
        self.conn.execute(
            "INSERT INTO config_versions
                (full_content, parameters_json, created_at, created_by, status, notes)
             VALUES (?1, ?2, ?3, ?4, 'draft', ?5)",
            params![
                full_content,
                parameters_json,
                now_rfc3339(),
                author.username,
                notes
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Make `version_number` the single applied version.
    ///
    /// The caller is expected to run this inside a transaction (see
    /// `Database::with_transaction`); the demote and promote statements are
    /// ordered so the unique index never sees two applied rows.
    pub fn mark_applied(&self, version_number: i64, applier: &Editor) -> Result<()> {
        if !self.exists(version_number)? {
            return Err(StageError::VersionNotFound(version_number));
        }
        self.conn.execute(
            "UPDATE config_versions SET status = 'rolled_back'
             WHERE status = 'applied' AND version_number != ?1",
            params![version_number],
        )?;
        self.conn.execute(
            "UPDATE config_versions SET status = 'applied', applied_at = ?2, applied_by = ?3
             WHERE version_number = ?1",
            params![version_number, now_rfc3339(), applier.username],
        )?;
        Ok(())
    }

    /// `create_draft` followed by `mark_applied`.
    pub fn record_applied(
        &self,
        full_content: &str,
        parameters: &BTreeMap<String, String>,
        author: &Editor,
        notes: Option<&str>,
    ) -> Result<i64> {
        let version = self.create_draft(full_content, parameters, author, notes)?;
        self.mark_applied(version, author)?;
        Ok(version)
    }

    fn exists(&self, version_number: i64) -> Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM config_versions WHERE version_number = ?1",
                params![version_number],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    pub fn get(&self, version_number: i64) -> Result<ConfigVersion> {
        let row = self
            .conn
            .query_row(
                "SELECT version_number, full_content, parameters_json, created_at, created_by,
                        applied_at, applied_by, status, notes
                 FROM config_versions WHERE version_number = ?1",
                params![version_number],
                |row| {
                    let created_at: String = row.get(3)?;
                    Ok((
                        ConfigVersion {
                            version_number: row.get(0)?,
                            full_content: row.get(1)?,
                            parameters: BTreeMap::new(),
                            created_at: parse_timestamp(3, &created_at)?,
                            created_by: row.get(4)?,
                            applied_at: optional_timestamp(5, row.get(5)?)?,
                            applied_by: row.get(6)?,
                            status: status_from_row(row, 7)?,
                            notes: row.get(8)?,
                        },
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let (mut version, parameters_json) =
            row.ok_or(StageError::VersionNotFound(version_number))?;
        version.parameters = serde_json::from_str(&parameters_json).map_err(serialization)?;
        Ok(version)
    }

    /// Most recent versions first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<VersionSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT version_number, created_at, created_by, applied_at, applied_by, status, notes
             FROM config_versions ORDER BY version_number DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![to_i64(limit)], |row| {
            let created_at: String = row.get(1)?;
            Ok(VersionSummary {
                version_number: row.get(0)?,
                created_at: parse_timestamp(1, &created_at)?,
                created_by: row.get(2)?,
                applied_at: optional_timestamp(3, row.get(3)?)?,
                applied_by: row.get(4)?,
                status: status_from_row(row, 5)?,
                notes: row.get(6)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// The currently applied version number, if any.
    pub fn current_applied(&self) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT version_number FROM config_versions WHERE status = 'applied'",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM config_versions", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    fn admin() -> Editor {
        Editor::new("1", "admin")
    }

    fn applied_rows(conn: &Connection) -> Result<i64> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM config_versions WHERE status = 'applied'",
            [],
            |row| row.get(0),
        )?)
    }

    fn params_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn drafts_get_increasing_numbers() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|c| {
            let store = VersionStore::new(c);
            let a = store.create_draft("a = 1\n", &BTreeMap::new(), &admin(), None)?;
            let b = store.create_draft("a = 2\n", &BTreeMap::new(), &admin(), Some("second"))?;
            assert!(b > a);
            let v = store.get(b)?;
            assert_eq!(v.status, VersionStatus::Draft);
            assert_eq!(v.full_content, "a = 2\n");
            assert_eq!(v.notes.as_deref(), Some("second"));
            assert!(v.applied_at.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn mark_applied_keeps_exactly_one_applied() {
        let db = Database::open_in_memory().unwrap();
        let (v1, v2) = db
            .with_transaction(|tx| {
                let store = VersionStore::new(tx);
                let v1 = store.record_applied("a = 1\n", &BTreeMap::new(), &admin(), None)?;
                let v2 = store.record_applied("a = 2\n", &BTreeMap::new(), &admin(), None)?;
                Ok((v1, v2))
            })
            .unwrap();

        db.with_conn(|c| {
            let store = VersionStore::new(c);
            assert_eq!(applied_rows(c)?, 1);
            assert_eq!(store.get(v1)?.status, VersionStatus::RolledBack);
            assert_eq!(store.get(v2)?.status, VersionStatus::Applied);
            assert_eq!(store.current_applied()?, Some(v2));

            // A rolled-back version may be applied again.
            store.mark_applied(v1, &admin())?;
            assert_eq!(store.get(v1)?.status, VersionStatus::Applied);
            assert_eq!(store.get(v2)?.status, VersionStatus::RolledBack);
            assert_eq!(applied_rows(c)?, 1);

            // Re-applying the applied version is harmless.
            store.mark_applied(v1, &admin())?;
            assert_eq!(applied_rows(c)?, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn unique_index_rejects_a_second_applied_row() {
        let db = Database::open_in_memory().unwrap();
        let result = db.with_conn(|c| {
            let store = VersionStore::new(c);
            let a = store.create_draft("a\n", &BTreeMap::new(), &admin(), None)?;
            let b = store.create_draft("b\n", &BTreeMap::new(), &admin(), None)?;
            c.execute(
                "UPDATE config_versions SET status = 'applied' WHERE version_number IN (?1, ?2)",
                params![a, b],
            )?;
            Ok(())
        });
        assert!(matches!(result, Err(StageError::Database(_))));
    }

    #[test]
    fn missing_versions_are_not_found() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|c| {
            let store = VersionStore::new(c);
            assert!(matches!(store.get(42), Err(StageError::VersionNotFound(42))));
            assert!(matches!(
                store.mark_applied(42, &admin()),
                Err(StageError::VersionNotFound(42))
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn list_recent_is_newest_first_and_limited() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|c| {
            let store = VersionStore::new(c);
            for i in 0..5 {
                let p = params_of(&[("myhostname", &format!("m{i}.example"))]);
                store.create_draft(&format!("myhostname = m{i}.example\n"), &p, &admin(), None)?;
            }
            let recent = store.list_recent(3)?;
            assert_eq!(recent.len(), 3);
            assert!(recent[0].version_number > recent[1].version_number);
            assert!(recent[1].version_number > recent[2].version_number);

            let v = store.get(recent[0].version_number)?;
            assert_eq!(v.parameters["myhostname"], "m4.example");
            Ok(())
        })
        .unwrap();
    }
}
