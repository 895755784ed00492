//! `mtastage credential USER`: stage relay host credentials.
//!
//! The password is read from `MTASTAGE_RELAY_PASSWORD` when set (CI/CD),
//! otherwise prompted for with confirmation.

use zeroize::Zeroizing;

use crate::cli::output;
use crate::cli::{editor, open_engine, Cli};
use crate::errors::{Result, StageError};

/// Environment variable consulted before prompting.
const PASSWORD_ENV: &str = "MTASTAGE_RELAY_PASSWORD";

/// Execute the `credential` command.
pub fn execute(cli: &Cli, user: &str) -> Result<()> {
    if user.is_empty() || user.contains(':') || user.chars().any(char::is_whitespace) {
        return Err(StageError::CommandFailed(
            "relay user must be non-empty without ':' or whitespace".into(),
        ));
    }

    let password = prompt_relay_password()?;
    let engine = open_engine(cli)?;
    engine.set_credential(user, &password, &editor(cli))?;

    output::success(&format!("Staged relay credentials for '{user}'"));
    output::tip("The password is stored encrypted; run `mtastage apply` to make it live.");
    Ok(())
}

fn prompt_relay_password() -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }

    let pw = dialoguer::Password::new()
        .with_prompt("Relay password")
        .with_confirmation("Confirm relay password", "Passwords do not match, try again")
        .interact()
        .map_err(|e| StageError::CommandFailed(format!("password prompt: {e}")))?;
    Ok(Zeroizing::new(pw))
}
