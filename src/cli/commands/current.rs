//! `mtastage current`: show the live value of every managed parameter.

use crate::cli::output;
use crate::cli::{open_engine, print_json, Cli};
use crate::errors::Result;

/// Execute the `current` command.
pub fn execute(cli: &Cli) -> Result<()> {
    let engine = open_engine(cli)?;
    let params = engine.get_current()?;

    if cli.json {
        return print_json(&params);
    }

    output::info(&format!(
        "Live configuration from {}",
        engine.settings().main_cf_path().display()
    ));
    output::print_current_table(&params);
    Ok(())
}
