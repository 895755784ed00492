//! Audit log: append-only record of engine operations.
//!
//! Every stage, discard, apply, rollback and credential change writes one
//! row.  Writing is fire-and-forget: a failed insert is logged and never
//! fails the operation being audited.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::{now_rfc3339, parse_timestamp, to_i64};
use crate::errors::Result;

/// A single audit log entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub actor: String,
    pub outcome: String,
    pub details: Option<String>,
}

pub struct AuditLog<'c> {
    conn: &'c Connection,
}

impl<'c> AuditLog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Record an operation, returning the insert error to the caller.
    ///
    /// Use this inside a transaction where the audit row must commit (or
    /// roll back) together with the change it describes.
    pub fn record(
        &self,
        operation: &str,
        actor: &str,
        outcome: &str,
        details: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO audit_log (timestamp, operation, actor, outcome, details)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![now_rfc3339(), operation, actor, outcome, details],
        )?;
        Ok(())
    }

    /// Record an operation.  Fire-and-forget: errors are logged and dropped.
    pub fn log(&self, operation: &str, actor: &str, outcome: &str, details: Option<&str>) {
        if let Err(e) = self.record(operation, actor, outcome, details) {
            log::warn!("audit write for '{operation}' failed: {e}");
        }
    }

    /// Query recent audit entries.
    ///
    /// - `limit`: maximum number of entries to return (most recent first).
    /// - `since`: if provided, only return entries at or after this time.
    pub fn query(&self, limit: usize, since: Option<DateTime<Utc>>) -> Result<Vec<AuditEntry>> {
        let limit = to_i64(limit);
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, operation, actor, outcome, details
             FROM audit_log
             WHERE ?1 IS NULL OR timestamp >= ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;

        let since = since.map(|ts| ts.to_rfc3339());
        let rows = stmt.query_map(params![since, limit], |row| {
            let ts: String = row.get(1)?;
            Ok(AuditEntry {
                id: row.get(0)?,
                timestamp: parse_timestamp(1, &ts)?,
                operation: row.get(2)?,
                actor: row.get(3)?,
                outcome: row.get(4)?,
                details: row.get(5)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}
