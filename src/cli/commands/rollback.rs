//! `mtastage rollback N`: restore configuration version N.

use crate::cli::output;
use crate::cli::{editor, open_engine, print_json, Cli};
use crate::errors::Result;

/// Execute the `rollback` command.
pub fn execute(cli: &Cli, version: i64) -> Result<()> {
    let engine = open_engine(cli)?;
    let outcome = engine.rollback(version, &editor(cli))?;

    if cli.json {
        return print_json(&outcome);
    }
    output::success(&outcome.message);
    if outcome.discarded > 0 {
        output::warning(&format!(
            "{} staged change(s) were discarded",
            outcome.discarded
        ));
    }
    Ok(())
}
