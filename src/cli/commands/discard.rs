//! `mtastage discard`: drop every staged change.

use crate::cli::output;
use crate::cli::{editor, open_engine, Cli};
use crate::errors::{Result, StageError};

/// Execute the `discard` command.
pub fn execute(cli: &Cli, force: bool) -> Result<()> {
    let engine = open_engine(cli)?;

    if !force {
        let confirm = dialoguer::Confirm::new()
            .with_prompt("Discard all staged changes?")
            .default(false)
            .interact()
            .map_err(|e| StageError::CommandFailed(format!("confirm prompt: {e}")))?;
        if !confirm {
            output::info("Cancelled.");
            return Ok(());
        }
    }

    let removed = engine.discard_staged(&editor(cli))?;
    output::success(&format!("Discarded {removed} staged change(s)"));
    Ok(())
}
