//! `mtastage rotate-secret`: re-encrypt the vault under a new process
//! secret.
//!
//! The current secret comes from `MTASTAGE_SECRET` or the configured
//! secret file as usual; the new one from `MTASTAGE_NEW_SECRET` or an
//! interactive prompt.

use zeroize::Zeroizing;

use crate::cli::output;
use crate::cli::{editor, open_engine, Cli};
use crate::crypto::{MasterKey, MIN_SECRET_LEN, SECRET_ENV};
use crate::errors::{Result, StageError};

/// Environment variable holding the replacement secret.
const NEW_SECRET_ENV: &str = "MTASTAGE_NEW_SECRET";

/// Execute the `rotate-secret` command.
pub fn execute(cli: &Cli) -> Result<()> {
    let mut engine = open_engine(cli)?;

    let new_secret = prompt_new_secret()?;
    let new_key = MasterKey::from_secret(new_secret.as_bytes())?;

    let rotated = engine.rotate_secret(new_key, &editor(cli))?;

    output::success(&format!("Re-encrypted {rotated} secret(s)"));
    output::warning(&format!(
        "Update {SECRET_ENV} (or the secret file) before the next run."
    ));
    Ok(())
}

fn prompt_new_secret() -> Result<Zeroizing<String>> {
    if let Ok(secret) = std::env::var(NEW_SECRET_ENV) {
        if !secret.is_empty() {
            if secret.len() < MIN_SECRET_LEN {
                return Err(StageError::CommandFailed(format!(
                    "new secret must be at least {MIN_SECRET_LEN} characters"
                )));
            }
            return Ok(Zeroizing::new(secret));
        }
    }

    loop {
        let secret = dialoguer::Password::new()
            .with_prompt("New process secret")
            .with_confirmation("Confirm new process secret", "Secrets do not match, try again")
            .interact()
            .map_err(|e| StageError::CommandFailed(format!("secret prompt: {e}")))?;

        if secret.len() < MIN_SECRET_LEN {
            output::warning(&format!(
                "Secret must be at least {MIN_SECRET_LEN} characters. Try again."
            ));
            continue;
        }
        return Ok(Zeroizing::new(secret));
    }
}
