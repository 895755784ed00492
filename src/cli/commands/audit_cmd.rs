//! `mtastage audit`: display the audit log.
//!
//! Usage:
//!   mtastage audit               # show last 50 entries
//!   mtastage audit --last 20     # show last 20
//!   mtastage audit --since 7d    # entries from last 7 days

use chrono::{DateTime, TimeDelta, Utc};

use crate::cli::output;
use crate::cli::{open_engine, print_json, Cli};
use crate::errors::{Result, StageError};

/// Execute the `audit` command.
pub fn execute(cli: &Cli, last: usize, since: Option<&str>) -> Result<()> {
    let since_dt = match since {
        Some(s) => Some(since_cutoff(s)?),
        None => None,
    };

    let engine = open_engine(cli)?;
    let entries = engine.audit_log(last, since_dt)?;

    if cli.json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        output::info("No audit entries found.");
        return Ok(());
    }

    output::print_audit_table(&entries);
    Ok(())
}

/// Turn `--since` (`<n>d`, `<n>h` or `<n>m`) into the oldest timestamp to show.
fn since_cutoff(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    let invalid = |why: &str| {
        StageError::CommandFailed(format!(
            "invalid --since '{input}': {why} (use e.g. 7d, 24h or 30m)"
        ))
    };

    let Some(unit) = input.chars().last() else {
        return Err(invalid("empty"));
    };
    let count: i64 = input[..input.len() - unit.len_utf8()]
        .parse()
        .ok()
        .filter(|n| *n >= 0)
        .ok_or_else(|| invalid("not a non-negative number"))?;

    let span = match unit {
        'd' => TimeDelta::try_days(count),
        'h' => TimeDelta::try_hours(count),
        'm' => TimeDelta::try_minutes(count),
        _ => return Err(invalid("unknown unit")),
    };
    span.and_then(|span| Utc::now().checked_sub_signed(span))
        .ok_or_else(|| invalid("too far back"))
}
