//! `mtastage validate`: dry-run the staged changes (plus optional extra
//! assignments) through every check without writing anything.

use crate::cli::output;
use crate::cli::{open_engine, parse_changes, print_json, Cli};
use crate::errors::{Result, StageError};

/// Execute the `validate` command.
pub fn execute(cli: &Cli, assignments: &[String]) -> Result<()> {
    let proposed = parse_changes(assignments, &[])?;
    let engine = open_engine(cli)?;
    let outcome = engine.validate_only(&proposed)?;

    if cli.json {
        print_json(&outcome)?;
    } else if outcome.ok {
        output::success("Configuration is valid");
    } else {
        output::print_field_errors(&outcome.errors);
    }

    if outcome.ok {
        Ok(())
    } else {
        Err(StageError::CommandFailed(format!(
            "validation found {} problem(s)",
            outcome.errors.len()
        )))
    }
}
