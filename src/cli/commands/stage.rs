//! `mtastage stage`: validate and stage parameter changes.
//!
//! Usage:
//!   mtastage stage myhostname=mail.example.com relayhost=[smtp.example.net]:587
//!   mtastage stage --unset relay_domains

use crate::cli::output;
use crate::cli::{editor, open_engine, parse_changes, print_json, Cli};
use crate::errors::{Result, StageError};

/// Execute the `stage` command.
pub fn execute(cli: &Cli, assignments: &[String], unset: &[String]) -> Result<()> {
    let changes = parse_changes(assignments, unset)?;
    if changes.is_empty() {
        return Err(StageError::CommandFailed(
            "nothing to stage: pass KEY=VALUE or --unset KEY".into(),
        ));
    }

    let engine = open_engine(cli)?;
    let diff = match engine.stage(&changes, &editor(cli)) {
        Ok(diff) => diff,
        Err(StageError::Validation(report)) => {
            output::print_field_errors(report.errors());
            return Err(StageError::CommandFailed(format!(
                "{} invalid value(s), nothing staged",
                report.errors().len()
            )));
        }
        Err(e) => return Err(e),
    };

    if cli.json {
        return print_json(&diff);
    }

    output::success(&format!("Staged {} change(s)", changes.len()));
    output::print_diff_table(&diff);
    output::tip("Run `mtastage apply` to make them live.");
    Ok(())
}
