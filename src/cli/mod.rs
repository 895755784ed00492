//! CLI module: Clap argument parser, output helpers, and command implementations.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use crate::config::Settings;
use crate::engine::Engine;
use crate::errors::{Result, StageError};
use crate::schema::{ChangeSet, StagedValue};
use crate::store::Editor;

/// mtastage: stage, validate and apply MTA configuration changes.
#[derive(Parser)]
#[command(
    name = "mtastage",
    about = "Stage, validate and apply mail transfer agent configuration",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (default: mtastage.toml)
    #[arg(
        short,
        long,
        default_value = Settings::FILE_NAME,
        env = "MTASTAGE_CONFIG",
        global = true
    )]
    pub config: PathBuf,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Name recorded as the editor of every change
    #[arg(short, long, env = "MTASTAGE_USER", global = true)]
    pub user: Option<String>,

    /// Print results as JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,
}

/// All available subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Show every managed parameter with its live value
    Current,

    /// Stage parameter changes (KEY=VALUE, empty value writes an empty parameter)
    Stage {
        /// Assignments such as myhostname=mail.example.com
        #[arg(value_name = "KEY=VALUE")]
        assignments: Vec<String>,

        /// Stage removal of a parameter from the configuration file
        #[arg(long, value_name = "KEY")]
        unset: Vec<String>,
    },

    /// Show staged changes against the live configuration
    Diff,

    /// Drop every staged change
    Discard {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Dry-run validation of the staged changes plus optional extra ones
    Validate {
        /// Additional assignments to check without staging them
        #[arg(value_name = "KEY=VALUE")]
        assignments: Vec<String>,
    },

    /// Write the staged changes to the MTA and reload it
    Apply,

    /// Restore a previous configuration version
    Rollback {
        /// Version number to restore
        version: i64,
    },

    /// List recent configuration versions
    History {
        /// Number of versions to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one configuration version in full
    Show {
        /// Version number
        version: i64,
    },

    /// Stage the relay host credentials (prompts for the password)
    Credential {
        /// Relay account user name
        user: String,
    },

    /// Re-encrypt stored secrets under a new process secret
    RotateSecret,

    /// View the audit log
    Audit {
        /// Number of entries to show (default: 50)
        #[arg(long, default_value = "50")]
        last: usize,
        /// Show entries since a duration ago (e.g. 7d, 24h, 30m)
        #[arg(long)]
        since: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers used by multiple commands
// ---------------------------------------------------------------------------

/// Load settings and open the engine.
pub fn open_engine(cli: &Cli) -> Result<Engine> {
    let settings = Settings::load(&cli.config)?;
    Engine::from_settings(settings)
}

/// The requested log level; unknown names fall back to `warn`.
pub fn log_level(cli: &Cli) -> LevelFilter {
    cli.log_level.parse().unwrap_or(LevelFilter::Warn)
}

/// The editor recorded for this invocation: `--user`, then `$USER`.
pub fn editor(cli: &Cli) -> Editor {
    let name = cli
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "admin".to_string());
    Editor::new(name.clone(), name)
}

/// Parse `KEY=VALUE` arguments (and `--unset` keys) into a change set.
pub fn parse_changes(assignments: &[String], unset: &[String]) -> Result<ChangeSet> {
    let mut changes = ChangeSet::new();
    for raw in assignments {
        let (key, value) = raw.split_once('=').ok_or_else(|| {
            StageError::CommandFailed(format!("expected KEY=VALUE, got '{raw}'"))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(StageError::CommandFailed(format!(
                "missing parameter name in '{raw}'"
            )));
        }
        changes.insert(key.to_string(), StagedValue::Set(value.to_string()));
    }
    for key in unset {
        if changes.contains_key(key.as_str()) {
            return Err(StageError::CommandFailed(format!(
                "'{key}' is both set and unset"
            )));
        }
        changes.insert(key.clone(), StagedValue::Unset);
    }
    Ok(changes)
}

/// Print `value` as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| StageError::SerializationError(e.to_string()))?;
    println!("{text}");
    Ok(())
}
