//! `mtastage diff`: show staged changes against the live configuration.

use crate::cli::output;
use crate::cli::{open_engine, print_json, Cli};
use crate::errors::Result;

/// Execute the `diff` command.
pub fn execute(cli: &Cli) -> Result<()> {
    let engine = open_engine(cli)?;
    let diff = engine.get_staged_diff()?;

    if cli.json {
        return print_json(&diff);
    }
    output::print_diff_table(&diff);
    Ok(())
}
