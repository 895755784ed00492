//! The staging and apply engine.
//!
//! `Engine` is constructed once per managed MTA and shared between
//! callers (`Arc<Engine>`).  It owns the database, the vault key, the MTA
//! handle and the apply lock; there is no global state.
//!
//! Reads (`get_current`, `get_staged_diff`, history) never take the apply
//! lock.  `apply` and `rollback` run the pipeline in `apply.rs` under it.

mod apply;
mod files;
mod state;

use std::collections::BTreeMap;
use std::io;

use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::Connection;
use serde::Serialize;
use zeroize::Zeroize;

use crate::config::Settings;
use crate::crypto::{load_process_secret, MasterKey};
use crate::errors::{Result, StageError};
use crate::lock::LockManager;
use crate::mainconf::MainConfig;
use crate::mta::{CommandMta, MtaControl};
use crate::schema::{self, Category, ChangeSet, StagedValue, SECRET_PLACEHOLDER};
use crate::store::{
    AuditEntry, AuditLog, ConfigVersion, Database, Editor, StagedDiff, StagingStore,
    VersionStore, VersionSummary,
};
use crate::validate::{validate_changes, FieldError};
use crate::vault::{staged_name, SecretVault};

pub use state::ApplyStage;

/// Vault record (and parameter key) holding the relay credential.
pub const RELAY_CREDENTIAL: &str = "relay_password";

/// Result of a successful apply.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub version: i64,
    pub applied_count: usize,
    pub message: String,
}

/// Result of a successful rollback.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub version: i64,
    /// Staged changes dropped because they were computed against the
    /// superseded configuration.
    pub discarded: usize,
    pub message: String,
}

/// Result of a dry-run validation.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub ok: bool,
    pub errors: Vec<FieldError>,
}

/// One row of the live parameter view.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentParameter {
    pub key: &'static str,
    pub category: Category,
    pub value: Option<String>,
    pub description: &'static str,
}

pub struct Engine {
    settings: Settings,
    db: Database,
    key: MasterKey,
    mta: Box<dyn MtaControl>,
    locks: LockManager,
}

impl Engine {
    /// Build an engine from explicit parts.  Creates the state directory
    /// and database if needed.
    pub fn open(settings: Settings, key: MasterKey, mta: Box<dyn MtaControl>) -> Result<Self> {
        settings.check()?;
        files::create_private_dir(&settings.state_dir)
            .map_err(|_| StageError::StateDir(settings.state_dir.clone()))?;
        let db = Database::open(&settings.database_path())?;
        let locks = LockManager::new(settings.lock_path(), settings.lock_timeout());
        Ok(Self {
            settings,
            db,
            key,
            mta,
            locks,
        })
    }

    /// Build an engine that drives the MTA through the configured
    /// commands, with the process secret from the environment or the
    /// configured secret file.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let secret = load_process_secret(settings.secret_file.as_deref())?;
        let key = MasterKey::from_secret(&secret)?;
        let mta = Box::new(CommandMta::new(settings.mta.clone()));
        Self::open(settings, key, mta)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Live main configuration text; a missing file reads as empty.
    fn read_live(&self) -> Result<String> {
        match std::fs::read_to_string(self.settings.main_cf_path()) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn audit(&self, operation: &str, editor: &Editor, outcome: &str, details: Option<&str>) {
        let _ = self.db.with_conn(|c| {
            AuditLog::new(c).log(operation, &editor.username, outcome, details);
            Ok(())
        });
    }

    /// Live value of `key` in UI form, secrets masked.
    fn live_display(
        vault: &SecretVault<'_>,
        live: &MainConfig,
        key: &str,
    ) -> Result<Option<String>> {
        let Some(spec) = schema::lookup(key) else {
            return Ok(None);
        };
        let value = if spec.secret {
            vault.contains(key)?.then(String::new)
        } else {
            live.get(key).map(|v| spec.from_file_value(v))
        };
        Ok(spec.display_value(value.as_deref()))
    }

    /// Every schema parameter with its live value (secrets masked).
    pub fn get_current(&self) -> Result<Vec<CurrentParameter>> {
        let live = MainConfig::parse(&self.read_live()?);
        self.db.with_conn(|c| {
            let vault = SecretVault::new(c, &self.key);
            schema::PARAMETERS
                .iter()
                .map(|spec| -> Result<CurrentParameter> {
                    Ok(CurrentParameter {
                        key: spec.key,
                        category: spec.category,
                        value: Self::live_display(&vault, &live, spec.key)?,
                        description: spec.description,
                    })
                })
                .collect()
        })
    }

    fn diff_against(&self, conn: &Connection, live: &MainConfig) -> Result<Vec<StagedDiff>> {
        let vault = SecretVault::new(conn, &self.key);
        let mut current = BTreeMap::new();
        for spec in schema::PARAMETERS {
            if let Some(value) = Self::live_display(&vault, live, spec.key)? {
                current.insert(spec.key, value);
            }
        }
        StagingStore::new(conn).diff(|key| current.get(key).cloned())
    }

    /// Staged keys whose value differs from the live one, ordered by
    /// category then key.  Secret values appear only as a placeholder.
    pub fn get_staged_diff(&self) -> Result<Vec<StagedDiff>> {
        let live = MainConfig::parse(&self.read_live()?);
        self.db.with_conn(|c| self.diff_against(c, &live))
    }

    /// Validate and stage a partial parameter set, then return the
    /// updated diff.  Nothing is staged if any value is invalid.
    ///
    /// Secret-bearing values go to the vault under a staged name; the
    /// staging table only ever holds the placeholder.
    pub fn stage(&self, changes: &ChangeSet, editor: &Editor) -> Result<Vec<StagedDiff>> {
        validate_changes(changes).into_result()?;

        self.db.with_transaction(|tx| {
            let staging = StagingStore::new(tx);
            let vault = SecretVault::new(tx, &self.key);

            for (key, value) in changes {
                let Some(spec) = schema::lookup(key) else {
                    continue;
                };
                let stored = match value {
                    StagedValue::Set(v) if spec.secret => {
                        vault.store(&staged_name(key), &spec.normalize(v), editor)?;
                        StagedValue::Set(SECRET_PLACEHOLDER.to_string())
                    }
                    StagedValue::Set(v) => StagedValue::Set(spec.normalize(v)),
                    StagedValue::Unset => {
                        if spec.secret {
                            vault.delete(&staged_name(key))?;
                        }
                        StagedValue::Unset
                    }
                };
                staging.stage(key, &stored, spec.category, editor)?;
            }

            let keys: Vec<&str> = changes.keys().map(String::as_str).collect();
            AuditLog::new(tx).record("stage", &editor.username, "ok", Some(&keys.join(", ")))
        })?;

        info!("{} staged {} change(s)", editor.username, changes.len());
        self.get_staged_diff()
    }

    /// Stage relay credentials as `user:password`.
    pub fn set_credential(
        &self,
        user: &str,
        password: &str,
        editor: &Editor,
    ) -> Result<Vec<StagedDiff>> {
        let mut changes = ChangeSet::new();
        changes.insert(
            RELAY_CREDENTIAL.to_string(),
            StagedValue::Set(format!("{user}:{password}")),
        );
        let result = self.stage(&changes, editor);
        if let Some(StagedValue::Set(mut v)) = changes.remove(RELAY_CREDENTIAL) {
            v.zeroize();
        }
        result
    }

    /// Drop every staged change, including staged credentials.
    pub fn discard_staged(&self, editor: &Editor) -> Result<usize> {
        let removed = self.db.with_transaction(|tx| {
            let removed = StagingStore::new(tx).discard_all()?;
            SecretVault::new(tx, &self.key).discard_staged()?;
            AuditLog::new(tx).record(
                "discard",
                &editor.username,
                "ok",
                Some(&format!("{removed} change(s)")),
            )?;
            Ok(removed)
        })?;
        info!("{} discarded {removed} staged change(s)", editor.username);
        Ok(removed)
    }

    /// Most recent versions first.
    pub fn list_history(&self, limit: usize) -> Result<Vec<VersionSummary>> {
        self.db.with_conn(|c| VersionStore::new(c).list_recent(limit))
    }

    /// Number of the version currently applied, if any.
    pub fn current_version(&self) -> Result<Option<i64>> {
        self.db.with_conn(|c| VersionStore::new(c).current_applied())
    }

    pub fn get_version(&self, version_number: i64) -> Result<ConfigVersion> {
        self.db.with_conn(|c| VersionStore::new(c).get(version_number))
    }

    pub fn audit_log(&self, limit: usize, since: Option<DateTime<Utc>>) -> Result<Vec<AuditEntry>> {
        self.db.with_conn(|c| AuditLog::new(c).query(limit, since))
    }

    /// Re-encrypt the vault under a new process secret.  The engine uses
    /// the new key from then on.
    pub fn rotate_secret(&mut self, new_key: MasterKey, editor: &Editor) -> Result<usize> {
        let rotated = self.db.with_transaction(|tx| {
            let n = SecretVault::new(tx, &self.key).rotate(&new_key, editor)?;
            AuditLog::new(tx).record(
                "rotate-secret",
                &editor.username,
                "ok",
                Some(&format!("{n} secret(s) re-encrypted")),
            )?;
            Ok(n)
        })?;
        self.key = new_key;
        warn!("vault re-encrypted under a new process secret; update MTASTAGE_SECRET");
        Ok(rotated)
    }
}
