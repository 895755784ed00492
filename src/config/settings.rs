use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StageError};

/// Engine configuration, loaded from `mtastage.toml`.
///
/// Every field has a sensible default for a stock Postfix installation,
/// so the engine works without any config file at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding the live MTA configuration.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Main configuration file name inside `config_dir`.
    #[serde(default = "default_main_cf")]
    pub main_cf: String,

    /// Relay credential file inside `config_dir`.  `None` disables
    /// credential management.
    #[serde(default = "default_credential_file")]
    pub credential_file: Option<String>,

    /// Directory for the database, lockfile, backups and check scratch space.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// File holding the process secret, used when `MTASTAGE_SECRET` is unset.
    #[serde(default)]
    pub secret_file: Option<PathBuf>,

    /// How long apply/rollback wait for the exclusive lock before `Busy`.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// How many backup files to keep per managed file (0 = keep all).
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,

    #[serde(default)]
    pub mta: MtaSettings,
}

/// External MTA commands.  Arguments may contain the placeholders
/// `{config_dir}` and `{file}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtaSettings {
    /// Configuration check; run against a scratch directory holding the candidate.
    #[serde(default = "default_check_command")]
    pub check_command: Vec<String>,

    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,

    /// Exit status 0 means the MTA is running.
    #[serde(default = "default_status_command")]
    pub status_command: Vec<String>,

    /// Rebuilds the lookup table for the credential file, if any.
    #[serde(default = "default_map_command")]
    pub map_command: Option<Vec<String>>,

    /// Files copied from `config_dir` next to the candidate for the check.
    #[serde(default = "default_check_companions")]
    pub check_companions: Vec<String>,

    /// Hard limit on every external command; a timeout is a terminal failure.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

// ── Serde default helpers ────────────────────────────────────────────

const MAX_COMMAND_TIMEOUT_SECS: u64 = 3_600;
const MAX_LOCK_TIMEOUT_MS: u64 = 3_600_000;

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/postfix")
}

fn default_main_cf() -> String {
    "main.cf".to_string()
}

fn default_credential_file() -> Option<String> {
    Some("sasl_passwd".to_string())
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/mtastage")
}

fn default_lock_timeout_ms() -> u64 {
    2_000
}

fn default_backup_retention() -> usize {
    20
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_check_command() -> Vec<String> {
    strings(&["postfix", "-c", "{config_dir}", "check"])
}

fn default_reload_command() -> Vec<String> {
    strings(&["postfix", "reload"])
}

fn default_status_command() -> Vec<String> {
    strings(&["postfix", "status"])
}

fn default_map_command() -> Option<Vec<String>> {
    Some(strings(&["postmap", "{file}"]))
}

fn default_check_companions() -> Vec<String> {
    strings(&["master.cf"])
}

fn default_command_timeout_secs() -> u64 {
    30
}

// ── Implementation ───────────────────────────────────────────────────

impl Default for MtaSettings {
    fn default() -> Self {
        Self {
            check_command: default_check_command(),
            reload_command: default_reload_command(),
            status_command: default_status_command(),
            map_command: default_map_command(),
            check_companions: default_check_companions(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl MtaSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            main_cf: default_main_cf(),
            credential_file: default_credential_file(),
            state_dir: default_state_dir(),
            secret_file: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            backup_retention: default_backup_retention(),
            mta: MtaSettings::default(),
        }
    }
}

impl Settings {
    /// Default config file name.
    pub const FILE_NAME: &'static str = "mtastage.toml";

    /// Load settings from `path`.
    ///
    /// If the file does not exist, sensible defaults are returned.
    /// If the file exists but cannot be parsed, an error is returned.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;

        let settings: Settings = toml::from_str(&contents).map_err(|e| {
            StageError::ConfigError(format!("Failed to parse {}: {e}", path.display()))
        })?;

        settings.check()?;
        Ok(settings)
    }

    /// Reject settings the engine cannot work with.
    pub fn check(&self) -> Result<()> {
        if self.main_cf.is_empty() || self.main_cf.contains('/') {
            return Err(StageError::ConfigError(
                "main_cf must be a plain file name".into(),
            ));
        }
        if let Some(cred) = &self.credential_file {
            if cred.is_empty() || cred.contains('/') || *cred == self.main_cf {
                return Err(StageError::ConfigError(
                    "credential_file must be a plain file name distinct from main_cf".into(),
                ));
            }
        }
        for (name, cmd) in [
            ("check_command", &self.mta.check_command),
            ("reload_command", &self.mta.reload_command),
            ("status_command", &self.mta.status_command),
        ] {
            if cmd.is_empty() {
                return Err(StageError::ConfigError(format!("mta.{name} cannot be empty")));
            }
        }
        if self.mta.map_command.as_ref().is_some_and(Vec::is_empty) {
            return Err(StageError::ConfigError(
                "mta.map_command cannot be empty (omit it instead)".into(),
            ));
        }
        if !(1..=MAX_COMMAND_TIMEOUT_SECS).contains(&self.mta.command_timeout_secs) {
            return Err(StageError::ConfigError(format!(
                "mta.command_timeout_secs must be between 1 and {MAX_COMMAND_TIMEOUT_SECS}"
            )));
        }
        if self.lock_timeout_ms > MAX_LOCK_TIMEOUT_MS {
            return Err(StageError::ConfigError(format!(
                "lock_timeout_ms cannot exceed {MAX_LOCK_TIMEOUT_MS}"
            )));
        }
        Ok(())
    }

    /// Path of the live main configuration file.
    pub fn main_cf_path(&self) -> PathBuf {
        self.config_dir.join(&self.main_cf)
    }

    /// Path of the relay credential file, if managed.
    pub fn credential_path(&self) -> Option<PathBuf> {
        self.credential_file
            .as_ref()
            .map(|name| self.config_dir.join(name))
    }

    /// SQLite database holding staging, versions, secrets and audit.
    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("mtastage.db")
    }

    /// On-disk advisory lock for apply/rollback.
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("apply.lock")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }

    /// Scratch configuration directory handed to the check command.
    pub fn check_dir(&self) -> PathBuf {
        self.state_dir.join("check")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
