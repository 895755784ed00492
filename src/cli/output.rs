//! Colored terminal output helpers.
//!
//! All user-facing output goes through these functions so we get
//! consistent styling across every command.

use comfy_table::{ContentArrangement, Table};
use console::style;

use crate::engine::CurrentParameter;
use crate::store::{AuditEntry, StagedDiff, VersionStatus, VersionSummary};
use crate::validate::FieldError;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Print a green success message: "check_mark {msg}"
pub fn success(msg: &str) {
    println!("{} {}", style("\u{2713}").green().bold(), msg);
}

/// Print a red error message: "x_mark {msg}"
pub fn error(msg: &str) {
    eprintln!("{} {}", style("\u{2717}").red().bold(), msg);
}

/// Print a yellow warning: "warning_sign {msg}"
pub fn warning(msg: &str) {
    eprintln!("{} {}", style("\u{26a0}").yellow().bold(), msg);
}

/// Print a blue info message: "info_sign {msg}"
pub fn info(msg: &str) {
    println!("{} {}", style("\u{2139}").blue().bold(), msg);
}

/// Print a dim tip/hint: "arrow {msg}"
pub fn tip(msg: &str) {
    println!("{} {}", style("\u{2192}").dim(), style(msg).dim());
}

fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

/// Print the live parameter view (Category, Parameter, Value).
pub fn print_current_table(params: &[CurrentParameter]) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Category", "Parameter", "Value"]);

    for p in params {
        let value = match p.value.as_deref() {
            Some("") => style("(empty)").dim().to_string(),
            Some(v) => v.to_string(),
            None => style("(not set)").dim().to_string(),
        };
        table.add_row(vec![p.category.as_str().to_string(), p.key.to_string(), value]);
    }

    println!("{table}");
}

/// Print staged changes (Parameter, Live, Staged).
pub fn print_diff_table(diff: &[StagedDiff]) {
    if diff.is_empty() {
        info("No staged changes.");
        tip("Run `mtastage stage KEY=VALUE` to stage one.");
        return;
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Category", "Parameter", "Live", "Staged"]);

    for d in diff {
        let new_value = match d.new_value.as_deref() {
            Some(v) => style(v).green().to_string(),
            None => style("(removed)").red().to_string(),
        };
        table.add_row(vec![
            d.category.as_str().to_string(),
            d.key.clone(),
            or_dash(d.old_value.as_deref()),
            new_value,
        ]);
    }

    println!(
        "{}",
        style(format!("{} staged change(s):", diff.len())).bold()
    );
    println!("{table}");
}

/// Print field-level validation errors.
pub fn print_field_errors(errors: &[FieldError]) {
    for e in errors {
        error(&format!("{}: {}", style(&e.field).bold(), e.message));
    }
}

/// Print version summaries (Version, Status, Created, Applied).
pub fn print_history_table(versions: &[VersionSummary]) {
    if versions.is_empty() {
        info("No configuration versions yet.");
        tip("Versions are recorded by `mtastage apply`.");
        return;
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Version", "Status", "Created", "Applied", "Notes"]);

    for v in versions {
        let applied = match (&v.applied_at, &v.applied_by) {
            (Some(at), Some(by)) => format!("{} by {by}", at.format(TIME_FORMAT)),
            (Some(at), None) => at.format(TIME_FORMAT).to_string(),
            _ => "-".to_string(),
        };
        table.add_row(vec![
            v.version_number.to_string(),
            colorize_status(v.status),
            format!("{} by {}", v.created_at.format(TIME_FORMAT), v.created_by),
            applied,
            or_dash(v.notes.as_deref()),
        ]);
    }

    println!("{table}");
}

fn colorize_status(status: VersionStatus) -> String {
    match status {
        VersionStatus::Applied => style(status.as_str()).green().bold().to_string(),
        VersionStatus::RolledBack => style(status.as_str()).yellow().to_string(),
        VersionStatus::Draft => style(status.as_str()).dim().to_string(),
    }
}

/// Print audit entries in a formatted table.
pub fn print_audit_table(entries: &[AuditEntry]) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Time", "Operation", "Actor", "Outcome", "Details"]);

    for entry in entries {
        table.add_row(vec![
            entry.timestamp.format(TIME_FORMAT).to_string(),
            colorize_operation(&entry.operation),
            entry.actor.clone(),
            colorize_outcome(&entry.outcome),
            or_dash(entry.details.as_deref()),
        ]);
    }

    println!(
        "{}",
        style(format!("{} audit entries:", entries.len())).bold()
    );
    println!("{table}");
}

/// Colorize operation names for display.
fn colorize_operation(op: &str) -> String {
    match op {
        "apply" => style(op).green().to_string(),
        "stage" => style(op).blue().to_string(),
        "discard" => style(op).red().to_string(),
        "rollback" | "rotate-secret" => style(op).yellow().to_string(),
        _ => op.to_string(),
    }
}

fn colorize_outcome(outcome: &str) -> String {
    match outcome {
        "ok" => style(outcome).green().to_string(),
        "noop" | "busy" => style(outcome).dim().to_string(),
        "fatal" => style(outcome).red().bold().to_string(),
        _ => style(outcome).red().to_string(),
    }
}
