//! `mtastage history` and `mtastage show N`: browse configuration versions.

use console::style;

use crate::cli::output;
use crate::cli::{open_engine, print_json, Cli};
use crate::errors::Result;

/// Execute the `history` command.
pub fn execute(cli: &Cli, limit: usize) -> Result<()> {
    let engine = open_engine(cli)?;
    let versions = engine.list_history(limit)?;

    if cli.json {
        return print_json(&versions);
    }
    output::print_history_table(&versions);
    if let Some(current) = engine.current_version()? {
        output::tip(&format!("Live configuration is version {current}."));
    }
    Ok(())
}

/// Execute the `show` command.
pub fn execute_show(cli: &Cli, version: i64) -> Result<()> {
    let engine = open_engine(cli)?;
    let v = engine.get_version(version)?;

    if cli.json {
        return print_json(&v);
    }

    println!(
        "{} {} ({})",
        style("Version").bold(),
        v.version_number,
        v.status
    );
    println!(
        "Created {} by {}",
        v.created_at.format("%Y-%m-%d %H:%M:%S"),
        v.created_by
    );
    if let (Some(at), Some(by)) = (&v.applied_at, &v.applied_by) {
        println!("Applied {} by {by}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(notes) = &v.notes {
        println!("Notes: {notes}");
    }
    println!();
    print!("{}", v.full_content);
    Ok(())
}
