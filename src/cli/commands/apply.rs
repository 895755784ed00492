//! `mtastage apply`: write the staged changes, reload the MTA and record
//! a new configuration version.

use crate::cli::output;
use crate::cli::{editor, open_engine, print_json, Cli};
use crate::errors::{Result, StageError};

/// Execute the `apply` command.
pub fn execute(cli: &Cli) -> Result<()> {
    let engine = open_engine(cli)?;

    let outcome = match engine.apply(&editor(cli)) {
        Ok(outcome) => outcome,
        Err(StageError::NothingToApply) => {
            output::info("Nothing to apply.");
            return Ok(());
        }
        Err(StageError::Validation(report)) => {
            output::print_field_errors(report.errors());
            return Err(StageError::CommandFailed(
                "staged configuration is invalid, nothing was written".into(),
            ));
        }
        Err(e) => return Err(e),
    };

    if cli.json {
        return print_json(&outcome);
    }
    output::success(&outcome.message);
    output::tip(&format!(
        "Run `mtastage show {}` to inspect the new version.",
        outcome.version
    ));
    Ok(())
}
