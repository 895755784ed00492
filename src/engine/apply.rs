//! The apply / rollback pipeline.
//!
//! ```text
//! Idle -> Locked -> Merging -> Validating -> Writing -> Reloading -> Verifying -> Committed
//!                                              \___________\____________\__> Compensating -> Idle
//! ```
//!
//! Nothing live is touched before `Writing`, and every live file is
//! backed up before the first rename.  A failure from `Writing` on
//! restores the backups and reloads; if that fails too the error is
//! `CompensationFailure` and nothing is retried.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use rusqlite::{Connection, Transaction};
use zeroize::Zeroizing;

use super::files::{self, BackupSet, PendingFile, ScratchDir};
use super::state::{ApplyStage, Progress};
use super::{ApplyOutcome, Engine, RollbackOutcome, ValidationOutcome, RELAY_CREDENTIAL};
use crate::errors::{Result, StageError};
use crate::mainconf::MainConfig;
use crate::schema::{self, ChangeSet, StagedValue, SECRET_PLACEHOLDER};
use crate::store::{AuditLog, Editor, StagedEntry, StagingStore, VersionStore};
use crate::validate::{validate_changes, validate_merged, ValidationReport};
use crate::vault::{staged_name, SecretVault};

/// Field name used for problems reported by the MTA's own check.
const CHECK_FIELD: &str = "mta_check";

/// A fully rendered configuration about to be checked and written.
struct Candidate {
    main_cf: String,
    /// Managed parameters in UI form, secrets masked.
    parameters: BTreeMap<String, String>,
    /// Relay credential in effect after the change.
    credential: Option<Zeroizing<String>>,
    /// New credential file content; `None` leaves the file alone.
    credential_file: Option<Zeroizing<String>>,
}

impl Candidate {
    fn build(
        live: &str,
        changes: &ChangeSet,
        credential: Option<Zeroizing<String>>,
        clear_credential: bool,
    ) -> Self {
        let mut doc = MainConfig::parse(live);
        for (key, value) in changes {
            if schema::lookup(key).is_some_and(|spec| !spec.secret) {
                doc.apply(key, value);
            }
        }
        Self::from_document(&doc, credential, clear_credential)
    }

    fn from_document(
        doc: &MainConfig,
        credential: Option<Zeroizing<String>>,
        clear_credential: bool,
    ) -> Self {
        let mut parameters = doc.managed_values();
        if credential.is_some() {
            parameters.insert(RELAY_CREDENTIAL.to_string(), SECRET_PLACEHOLDER.to_string());
        }

        let relayhost = doc.get("relayhost").unwrap_or("").trim();
        let credential_file = match &credential {
            Some(value) if !relayhost.is_empty() => {
                Some(Zeroizing::new(format!("{relayhost} {}\n", value.as_str())))
            }
            Some(_) => None,
            None if clear_credential => Some(Zeroizing::new(String::new())),
            None => None,
        };

        Self {
            main_cf: doc.render(),
            parameters,
            credential,
            credential_file,
        }
    }
}

/// The credential in effect once `staged` (if any) is applied.
fn effective_credential(
    vault: &SecretVault<'_>,
    staged: Option<&StagedValue>,
) -> Result<Option<Zeroizing<String>>> {
    match staged {
        Some(StagedValue::Set(_)) => vault.retrieve(&staged_name(RELAY_CREDENTIAL)).map(Some),
        Some(StagedValue::Unset) => Ok(None),
        None if vault.contains(RELAY_CREDENTIAL)? => vault.retrieve(RELAY_CREDENTIAL).map(Some),
        None => Ok(None),
    }
}

fn describe_failure(e: &StageError) -> String {
    match e {
        StageError::ExternalTool { detail, .. } => detail.clone(),
        other => other.to_string(),
    }
}

fn outcome_of(e: &StageError) -> &'static str {
    match e {
        StageError::NothingToApply => "noop",
        StageError::Busy => "busy",
        StageError::Validation(_) | StageError::ValidationFailed(_) => "rejected",
        e if e.is_fatal() => "fatal",
        _ => "failed",
    }
}

impl Engine {
    /// Run the MTA's check on `candidate` in a scratch directory.
    fn check_candidate(&self, candidate: &str) -> Result<()> {
        let scratch = ScratchDir::prepare(
            &self.settings.check_dir(),
            &self.settings.config_dir,
            &self.settings.mta.check_companions,
            &self.settings.main_cf,
            candidate,
        )?;
        let report = self
            .mta
            .check(scratch.path(), &scratch.main_file(&self.settings.main_cf))?;
        if !report.is_ok() {
            return Err(StageError::ValidationFailed(report.errors));
        }
        Ok(())
    }

    /// Write the pending main file and check it.  The pending file is
    /// removed again if the check fails.
    fn prepare_pending(&self, candidate: &Candidate) -> Result<PendingFile> {
        let main_path = self.settings.main_cf_path();
        let pending = PendingFile::write(
            files::pending_path(&main_path),
            candidate.main_cf.as_bytes(),
            None,
            Some(&main_path),
        )
        .map_err(|e| StageError::WriteFailure(format!("pending file: {e}")))?;
        self.check_candidate(&candidate.main_cf)?;
        Ok(pending)
    }

    /// Restore backups and reload.  Returns the error to surface: `cause`
    /// when the previous configuration is back in place, otherwise a
    /// fatal `CompensationFailure`.
    fn compensate(
        &self,
        progress: &mut Progress,
        backups: &BackupSet,
        map_file: Option<&Path>,
        cause: StageError,
    ) -> StageError {
        progress.fail();
        let failed = progress.failed_stage();
        warn!(
            "{} failed while {failed}: {cause}; restoring previous configuration",
            progress.operation()
        );
        progress.enter(ApplyStage::Compensating);

        let mut problems: Vec<String> = Vec::new();
        match backups.restore() {
            Ok(done) => {
                if let Some(file) = map_file {
                    if let Err(e) = self.reset_map(file, done.was_removed(file)) {
                        problems.push(format!("rebuilding credential map: {e}"));
                    }
                }
                if let Err(e) = self.mta.reload() {
                    problems.push(format!("reloading previous configuration: {e}"));
                }
            }
            Err(e) => problems.push(format!("restoring backups: {e}")),
        }
        let restored = if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        };

        match restored {
            Ok(()) => {
                progress.enter(ApplyStage::Idle);
                info!("previous configuration restored");
                cause
            }
            Err(detail) => {
                let detail = format!("{detail} (original failure: {cause})");
                error!(
                    "FATAL: {} could not restore the previous configuration after failing while {failed}: {detail}",
                    progress.operation()
                );
                StageError::CompensationFailure {
                    stage: failed.to_string(),
                    detail,
                }
            }
        }
    }

    /// Bring the lookup table derived from `file` back in line with the
    /// restored files.  When `file` did not exist before, the table is
    /// rebuilt from an empty source which is then removed again.
    fn reset_map(&self, file: &Path, was_removed: bool) -> Result<()> {
        if !was_removed {
            return self.mta.rebuild_map(file);
        }
        PendingFile::write(files::pending_path(file), b"", Some(0o600), None)?.commit_to(file)?;
        let rebuilt = self.mta.rebuild_map(file);
        std::fs::remove_file(file)?;
        rebuilt
    }

    /// Writing through Committed.  `commit` runs in one database
    /// transaction after the MTA is confirmed running.
    fn activate<T, F>(
        &self,
        progress: &mut Progress,
        candidate: &Candidate,
        pending: PendingFile,
        commit: F,
    ) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        progress.enter(ApplyStage::Writing);
        let main_path = self.settings.main_cf_path();
        let credential_path: Option<PathBuf> = self
            .settings
            .credential_path()
            .filter(|_| candidate.credential_file.is_some());

        let mut touched: Vec<&Path> = vec![main_path.as_path()];
        if let Some(path) = &credential_path {
            touched.push(path.as_path());
        }
        // Nothing live has changed yet; `pending` is dropped on return.
        let backups = BackupSet::take(&self.settings.backup_dir(), &touched)
            .map_err(|e| StageError::WriteFailure(format!("backup: {e}")))?;

        let written = (|| -> Result<()> {
            if let (Some(path), Some(content)) = (&credential_path, &candidate.credential_file) {
                let cred = PendingFile::write(
                    files::pending_path(path),
                    content.as_bytes(),
                    Some(0o600),
                    None,
                )?;
                cred.commit_to(path)?;
                self.mta.rebuild_map(path)?;
            }
            pending.commit_to(&main_path)?;
            Ok(())
        })();
        let map_file = credential_path.as_deref();
        if let Err(e) = written {
            let cause = StageError::WriteFailure(describe_failure(&e));
            return Err(self.compensate(progress, &backups, map_file, cause));
        }

        progress.enter(ApplyStage::Reloading);
        if let Err(e) = self.mta.reload() {
            let cause = StageError::ReloadFailed(describe_failure(&e));
            return Err(self.compensate(progress, &backups, map_file, cause));
        }

        progress.enter(ApplyStage::Verifying);
        let verified = match self.mta.is_running() {
            Ok(true) => Ok(()),
            Ok(false) => Err("MTA is not running after reload".to_string()),
            Err(e) => Err(describe_failure(&e)),
        };
        if let Err(detail) = verified {
            let cause = StageError::VerifyFailed(detail);
            return Err(self.compensate(progress, &backups, map_file, cause));
        }

        let value = match self.db.with_transaction(commit) {
            Ok(value) => value,
            Err(e) => return Err(self.compensate(progress, &backups, map_file, e)),
        };
        progress.enter(ApplyStage::Committed);

        self.prune_backups(&touched);
        Ok(value)
    }

    fn prune_backups(&self, touched: &[&Path]) {
        let keep = self.settings.backup_retention;
        for path in touched {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            match files::prune_backups(&self.settings.backup_dir(), &name, keep) {
                Ok(0) => {}
                Ok(n) => debug!("Pruned {n} old backup(s) of {name}"),
                Err(e) => warn!("could not prune backups of {name}: {e}"),
            }
        }
    }

    /// Record a failed attempt.  Error messages never carry secret values.
    fn audit_failure(&self, operation: &str, editor: &Editor, progress: &Progress, e: &StageError) {
        let details = format!("{}: {e}", progress.failed_stage());
        self.audit(operation, editor, outcome_of(e), Some(&details));
    }

    /// Merge every staged change into the live configuration, check it,
    /// write it, reload the MTA and record the result as a new applied
    /// version.
    pub fn apply(&self, editor: &Editor) -> Result<ApplyOutcome> {
        let mut progress = Progress::new("apply");

        // Callers racing on an empty staging area all see NothingToApply,
        // never Busy.
        if self.db.with_conn(|c| StagingStore::new(c).is_empty())? {
            let e = StageError::NothingToApply;
            self.audit_failure("apply", editor, &progress, &e);
            return Err(e);
        }

        let guard = match self.locks.acquire() {
            Ok(guard) => guard,
            Err(e) => {
                self.audit_failure("apply", editor, &progress, &e);
                return Err(e);
            }
        };
        progress.enter(ApplyStage::Locked);

        let result = self.apply_locked(&mut progress, editor);
        drop(guard);

        match &result {
            Ok(outcome) => info!("{}", outcome.message),
            Err(e) => self.audit_failure("apply", editor, &progress, e),
        }
        progress.enter(ApplyStage::Idle);
        result
    }

    fn apply_locked(&self, progress: &mut Progress, editor: &Editor) -> Result<ApplyOutcome> {
        progress.enter(ApplyStage::Merging);
        let live = self.read_live()?;
        let live_doc = MainConfig::parse(&live);

        let (entries, diff, candidate) = self.db.with_conn(|c| {
            let entries = StagingStore::new(c).list()?;
            let diff = self.diff_against(c, &live_doc)?;
            let changes: ChangeSet = entries
                .iter()
                .map(|e| (e.key.clone(), e.value.clone()))
                .collect();
            let vault = SecretVault::new(c, &self.key);
            let staged_credential = changes.get(RELAY_CREDENTIAL);
            let credential = effective_credential(&vault, staged_credential)?;
            let clear = matches!(staged_credential, Some(StagedValue::Unset));
            let candidate = Candidate::build(&live, &changes, credential, clear);
            Ok((entries, diff, candidate))
        })?;
        if entries.is_empty() {
            return Err(StageError::NothingToApply);
        }

        progress.enter(ApplyStage::Validating);
        validate_merged(&candidate.parameters, candidate.credential.is_some()).into_result()?;
        let pending = self.prepare_pending(&candidate)?;

        let baseline = MainConfig::parse(&live).managed_values();
        let details = serde_json::to_string(&diff)
            .map_err(|e| StageError::SerializationError(e.to_string()))?;
        let applied_count = entries.len();

        let version = self.activate(progress, &candidate, pending, |tx| {
            let versions = VersionStore::new(tx);
            if versions.count()? == 0 {
                versions.record_applied(&live, &baseline, editor, Some("baseline before first apply"))?;
            }
            let version = versions.record_applied(&candidate.main_cf, &candidate.parameters, editor, None)?;
            self.commit_credential(tx, &entries, &candidate, editor)?;
            StagingStore::new(tx).clear_applied(&entries)?;
            AuditLog::new(tx).record("apply", &editor.username, "ok", Some(&details))?;
            Ok(version)
        })?;

        Ok(ApplyOutcome {
            version,
            applied_count,
            message: format!("applied {applied_count} change(s) as version {version}"),
        })
    }

    /// Move an applied staged credential into place.  A credential that
    /// was re-staged during the apply stays staged; the value actually
    /// written is stored as the live one.
    fn commit_credential(
        &self,
        conn: &Connection,
        applied: &[StagedEntry],
        candidate: &Candidate,
        editor: &Editor,
    ) -> Result<()> {
        let Some(entry) = applied.iter().find(|e| e.key == RELAY_CREDENTIAL) else {
            return Ok(());
        };
        let vault = SecretVault::new(conn, &self.key);
        match entry.value {
            StagedValue::Set(_) => {
                let unchanged = StagingStore::new(conn)
                    .get(RELAY_CREDENTIAL)?
                    .is_some_and(|current| current.staged_at == entry.staged_at);
                if unchanged {
                    vault.promote(&staged_name(RELAY_CREDENTIAL), RELAY_CREDENTIAL, editor)?;
                } else if let Some(value) = &candidate.credential {
                    vault.store(RELAY_CREDENTIAL, value, editor)?;
                }
            }
            StagedValue::Unset => {
                vault.delete(RELAY_CREDENTIAL)?;
            }
        }
        Ok(())
    }

    /// Restore the configuration stored in `version_number` and make it
    /// the applied version.  Any staged changes are discarded.
    pub fn rollback(&self, version_number: i64, editor: &Editor) -> Result<RollbackOutcome> {
        let mut progress = Progress::new("rollback");
        let operation = "rollback";

        let target = match self.get_version(version_number) {
            Ok(v) => v,
            Err(e) => {
                self.audit_failure(operation, editor, &progress, &e);
                return Err(e);
            }
        };

        let guard = match self.locks.acquire() {
            Ok(guard) => guard,
            Err(e) => {
                self.audit_failure(operation, editor, &progress, &e);
                return Err(e);
            }
        };
        progress.enter(ApplyStage::Locked);

        let result = (|| -> Result<RollbackOutcome> {
            // The stored snapshot replaces the merge; the credential file is
            // rebuilt from the live vault.
            let doc = MainConfig::parse(&target.full_content);
            let credential = self
                .db
                .with_conn(|c| effective_credential(&SecretVault::new(c, &self.key), None))?;
            let candidate = Candidate::from_document(&doc, credential, false);

            progress.enter(ApplyStage::Validating);
            let pending = self.prepare_pending(&candidate)?;

            let discarded = self.activate(&mut progress, &candidate, pending, |tx| {
                VersionStore::new(tx).mark_applied(version_number, editor)?;
                let discarded = StagingStore::new(tx).discard_all()?;
                SecretVault::new(tx, &self.key).discard_staged()?;
                AuditLog::new(tx).record(
                    operation,
                    &editor.username,
                    "ok",
                    Some(&format!("version {version_number}; {discarded} staged change(s) discarded")),
                )?;
                Ok(discarded)
            })?;

            Ok(RollbackOutcome {
                version: version_number,
                discarded,
                message: format!("rolled back to version {version_number}"),
            })
        })();
        drop(guard);

        match &result {
            Ok(outcome) => info!("{}", outcome.message),
            Err(e) => self.audit_failure(operation, editor, &progress, e),
        }
        progress.enter(ApplyStage::Idle);
        result
    }

    /// Validate staged changes plus `proposed` without touching the live
    /// configuration, the staging area or the version history.
    ///
    /// Field problems, whole-configuration problems and the MTA's own
    /// check are all reported in the outcome rather than as an error.
    pub fn validate_only(&self, proposed: &ChangeSet) -> Result<ValidationOutcome> {
        let entries = self.db.with_conn(|c| StagingStore::new(c).list())?;
        if entries.is_empty() && proposed.is_empty() {
            return Err(StageError::NothingToApply);
        }

        let mut report: ValidationReport = validate_changes(proposed);

        let mut changes: ChangeSet = entries
            .into_iter()
            .map(|e| (e.key, e.value))
            .collect();
        for (key, value) in proposed {
            if let Some(spec) = schema::lookup(key) {
                let value = match value {
                    StagedValue::Set(v) => StagedValue::Set(spec.normalize(v)),
                    StagedValue::Unset => StagedValue::Unset,
                };
                changes.insert(key.clone(), value);
            }
        }

        let live = self.read_live()?;
        let credential = match proposed.get(RELAY_CREDENTIAL) {
            Some(StagedValue::Set(v)) => Some(Zeroizing::new(v.trim().to_string())),
            Some(StagedValue::Unset) => None,
            None => self.db.with_conn(|c| {
                effective_credential(&SecretVault::new(c, &self.key), changes.get(RELAY_CREDENTIAL))
            })?,
        };
        let clear = matches!(changes.get(RELAY_CREDENTIAL), Some(StagedValue::Unset));
        let candidate = Candidate::build(&live, &changes, credential, clear);

        report.extend(validate_merged(&candidate.parameters, candidate.credential.is_some()));

        // Only hand the MTA a candidate whose fields are well-formed.
        if report.is_ok() {
            match self.check_candidate(&candidate.main_cf) {
                Ok(()) => {}
                Err(StageError::ValidationFailed(lines)) => {
                    for line in lines {
                        report.push(CHECK_FIELD, line);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        debug!("validate_only: {} problem(s)", report.errors().len());
        Ok(ValidationOutcome {
            ok: report.is_ok(),
            errors: report.into_errors(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_writes_credential_line_for_relayhost() {
        let mut changes = ChangeSet::new();
        changes.insert(
            "relayhost".to_string(),
            StagedValue::Set("[smtp.example.com]:587".into()),
        );
        let c = Candidate::build(
            "myhostname = mx.example.com\n",
            &changes,
            Some(Zeroizing::new("user:pw".to_string())),
            false,
        );
        assert_eq!(
            c.credential_file.as_deref().map(String::as_str),
            Some("[smtp.example.com]:587 user:pw\n")
        );
        assert_eq!(c.parameters[RELAY_CREDENTIAL], SECRET_PLACEHOLDER);
        assert!(!c.main_cf.contains("user:pw"));
    }

    #[test]
    fn candidate_clears_or_keeps_credential_file() {
        let cleared = Candidate::build("relayhost = [a.example]\n", &ChangeSet::new(), None, true);
        assert_eq!(cleared.credential_file.as_deref().map(String::as_str), Some(""));

        let kept = Candidate::build("relayhost = [a.example]\n", &ChangeSet::new(), None, false);
        assert!(kept.credential_file.is_none());
        assert!(!kept.parameters.contains_key(RELAY_CREDENTIAL));
    }

    #[test]
    fn outcomes_classify_errors() {
        assert_eq!(outcome_of(&StageError::NothingToApply), "noop");
        assert_eq!(outcome_of(&StageError::Busy), "busy");
        assert_eq!(outcome_of(&StageError::ValidationFailed(vec![])), "rejected");
        assert_eq!(
            outcome_of(&StageError::CompensationFailure {
                stage: "reloading".into(),
                detail: "x".into()
            }),
            "fatal"
        );
        assert_eq!(outcome_of(&StageError::ReloadFailed("x".into())), "failed");
    }
}
