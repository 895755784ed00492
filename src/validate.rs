//! Parameter validation.
//!
//! Validators are pure: they never touch the filesystem, the database or
//! the MTA.  Each one appends `(field, message)` pairs to a
//! `ValidationReport` instead of failing fast, so a caller can report every
//! problem in a single round trip.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::OnceLock;

use ipnet::IpNet;
use regex::Regex;
use serde::Serialize;

use crate::errors::{Result, StageError};
use crate::schema::{self, ChangeSet, ParamSpec, StagedValue, ValueKind};

/// Maximum length of a host or domain name.
const MAX_HOSTNAME_LEN: usize = 253;

/// Closed set of TLS security levels (empty = unset).
pub const TLS_POLICIES: &[&str] = &["none", "may", "encrypt", "dane", "verify", "secure"];

/// A single validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Accumulated validation problems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    errors: Vec<FieldError>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<FieldError> {
        self.errors
    }

    /// `Ok(())` when empty, otherwise `StageError::Validation(self)`.
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(StageError::Validation(self))
        }
    }

    /// Append every problem from `other`.
    pub fn extend(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
    }

    /// Whether any error was reported against `field`.
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        f.write_str(&parts.join("; "))
    }
}

fn label_regex() -> &'static Regex {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    LABEL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("static regex")
    })
}

fn restriction_regex() -> &'static Regex {
    static RESTRICTION: OnceLock<Regex> = OnceLock::new();
    RESTRICTION.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9_]*(?:\s+\S+)?$").expect("static regex")
    })
}

fn lookup_table_regex() -> &'static Regex {
    static TABLE: OnceLock<Regex> = OnceLock::new();
    TABLE.get_or_init(|| Regex::new(r"^[a-z0-9_]+:/\S+$").expect("static regex"))
}

// ── Individual validators ────────────────────────────────────────────

/// RFC-1123 host or domain name, at most 253 characters.  A single
/// trailing dot (fully-qualified form) is tolerated.
pub fn validate_hostname(report: &mut ValidationReport, field: &str, value: &str) {
    if let Some(reason) = hostname_problem(value) {
        report.push(field, format!("'{value}' is not a valid hostname: {reason}"));
    }
}

fn hostname_problem(value: &str) -> Option<&'static str> {
    let name = value.strip_suffix('.').unwrap_or(value);
    if name.is_empty() {
        return Some("empty");
    }
    if name.len() > MAX_HOSTNAME_LEN {
        return Some("longer than 253 characters");
    }
    if !name.split('.').all(|label| label_regex().is_match(label)) {
        return Some("labels must be 1-63 letters, digits or hyphens, not starting or ending with a hyphen");
    }
    None
}

/// `local@domain`.
pub fn validate_email(report: &mut ValidationReport, field: &str, value: &str) {
    match value.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && !local.contains(char::is_whitespace) => {
            if hostname_problem(domain).is_some() {
                report.push(field, format!("'{value}' has an invalid domain part"));
            }
        }
        _ => report.push(field, format!("'{value}' is not a valid email address")),
    }
}

/// Newline-separated IP addresses or CIDR networks; each line is checked
/// independently.  Bracketed IPv6 (`[::1]/128`) and `type:/path` lookup
/// tables are accepted.
pub fn validate_network_list(report: &mut ValidationReport, field: &str, value: &str) {
    for line in value.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !is_network_entry(line) {
            report.push(
                field,
                format!("'{line}' is not a valid IP address or CIDR network"),
            );
        }
    }
}

fn is_network_entry(entry: &str) -> bool {
    if lookup_table_regex().is_match(entry) {
        return true;
    }
    let unbracketed = match entry.strip_prefix('[') {
        Some(rest) => match rest.split_once(']') {
            Some((addr, suffix)) => format!("{addr}{suffix}"),
            None => return false,
        },
        None => entry.to_string(),
    };
    unbracketed.parse::<IpNet>().is_ok() || unbracketed.parse::<IpAddr>().is_ok()
}

/// `[host]:port`, `host:port`, `[host]` or bare `host`.  Empty means
/// direct delivery.
pub fn validate_relay_host(report: &mut ValidationReport, field: &str, value: &str) {
    if value.is_empty() {
        return;
    }

    let (host, port, bracketed) = if let Some(rest) = value.strip_prefix('[') {
        match rest.split_once(']') {
            Some((host, "")) => (host, None, true),
            Some((host, tail)) => match tail.strip_prefix(':') {
                Some(port) => (host, Some(port), true),
                None => {
                    report.push(field, format!("'{value}' has unexpected text after ']'"));
                    return;
                }
            },
            None => {
                report.push(field, format!("'{value}' is missing a closing ']'"));
                return;
            }
        }
    } else {
        match value.rsplit_once(':') {
            Some((host, port)) => (host, Some(port), false),
            None => (value, None, false),
        }
    };

    let host_ok = if bracketed {
        let addr = host.strip_prefix("ipv6:").unwrap_or(host);
        addr.parse::<IpAddr>().is_ok() || hostname_problem(host).is_none()
    } else {
        !host.contains(':') && hostname_problem(host).is_none()
    };
    if !host_ok {
        report.push(field, format!("'{host}' is not a valid relay host"));
    }

    if let Some(port) = port {
        validate_port(report, field, port);
    }
}

/// TLS security level from the closed set; empty string = unset.
pub fn validate_tls_policy(report: &mut ValidationReport, field: &str, value: &str) {
    if !value.is_empty() && !TLS_POLICIES.contains(&value) {
        report.push(
            field,
            format!(
                "'{value}' is not a TLS security level (expected one of {})",
                TLS_POLICIES.join(", ")
            ),
        );
    }
}

/// TCP port, 1-65535.
pub fn validate_port(report: &mut ValidationReport, field: &str, value: &str) {
    match value.parse::<u32>() {
        Ok(p) if (1..=65_535).contains(&p) => {}
        _ => report.push(field, format!("port '{value}' must be between 1 and 65535")),
    }
}

/// Non-empty after trimming.
pub fn validate_required(report: &mut ValidationReport, field: &str, value: Option<&str>) {
    if value.map_or(true, |v| v.trim().is_empty()) {
        report.push(field, "is required");
    }
}

fn validate_yes_no(report: &mut ValidationReport, field: &str, value: &str) {
    if !matches!(value, "" | "yes" | "no") {
        report.push(field, format!("'{value}' must be 'yes' or 'no'"));
    }
}

fn validate_single_line(report: &mut ValidationReport, field: &str, value: &str) {
    if value.chars().any(char::is_control) {
        report.push(field, "must be a single line without control characters");
    }
}

fn validate_credential(report: &mut ValidationReport, field: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    let ok = value.split_once(':').is_some_and(|(user, pass)| {
        !user.is_empty()
            && !pass.is_empty()
            && !value.chars().any(|c| c.is_whitespace() || c.is_control())
    });
    if !ok {
        // The value itself is never echoed back.
        report.push(
            field,
            "must be 'user:password' with no whitespace in either part",
        );
    }
}

/// Run the validator for `spec` against a single value.
pub fn validate_value(report: &mut ValidationReport, spec: &ParamSpec, value: &str) {
    let field = spec.key;
    if spec.required {
        validate_required(report, field, Some(value));
        if value.trim().is_empty() {
            return;
        }
    }
    if value.is_empty() {
        return;
    }

    match spec.kind {
        ValueKind::Hostname => validate_hostname(report, field, value),
        ValueKind::Origin => {
            if !matches!(value, "$myhostname" | "$mydomain") {
                validate_hostname(report, field, value);
            }
        }
        ValueKind::Recipient => {
            if value.contains('@') {
                validate_email(report, field, value);
            } else if !label_regex().is_match(value) {
                report.push(field, format!("'{value}' is not a valid recipient"));
            }
        }
        ValueKind::Interfaces => {
            for line in value.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let ok = matches!(line, "all" | "loopback-only")
                    || line.parse::<IpAddr>().is_ok()
                    || hostname_problem(line).is_none();
                if !ok {
                    report.push(field, format!("'{line}' is not a valid interface"));
                }
            }
        }
        ValueKind::Protocols => {
            if !matches!(value, "all" | "ipv4" | "ipv6") {
                report.push(field, format!("'{value}' must be all, ipv4 or ipv6"));
            }
        }
        ValueKind::NonNegativeInt => {
            if value.parse::<u64>().is_err() {
                report.push(field, format!("'{value}' must be a non-negative integer"));
            }
        }
        ValueKind::Networks => validate_network_list(report, field, value),
        ValueKind::RelayHost => validate_relay_host(report, field, value),
        ValueKind::Domains => {
            for line in value.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if !line.starts_with('$') && !lookup_table_regex().is_match(line) {
                    validate_hostname(report, field, line);
                }
            }
        }
        ValueKind::TlsPolicy => validate_tls_policy(report, field, value),
        ValueKind::AbsolutePath => {
            if !value.starts_with('/') || value.chars().any(char::is_control) {
                report.push(field, format!("'{value}' must be an absolute path"));
            }
        }
        ValueKind::YesNo => validate_yes_no(report, field, value),
        ValueKind::Text => validate_single_line(report, field, value),
        ValueKind::Restrictions => {
            for line in value.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if !restriction_regex().is_match(line) {
                    report.push(field, format!("'{line}' is not a valid restriction"));
                }
            }
        }
        ValueKind::Credential => validate_credential(report, field, value),
    }
}

/// Validate a partial parameter set before it is staged.
pub fn validate_changes(changes: &ChangeSet) -> ValidationReport {
    let mut report = ValidationReport::new();
    for (key, value) in changes {
        let Some(spec) = schema::lookup(key) else {
            report.push(key, "unknown parameter");
            continue;
        };
        match value {
            StagedValue::Set(v) => validate_value(&mut report, spec, &spec.normalize(v)),
            StagedValue::Unset if spec.required => report.push(key, "is required and cannot be unset"),
            StagedValue::Unset => {}
        }
    }
    report
}

/// Whole-configuration checks on a merged parameter view (UI form).
///
/// `has_credential` says whether relay credentials will be present after
/// the change; the credential itself is never passed here.
pub fn validate_merged(params: &BTreeMap<String, String>, has_credential: bool) -> ValidationReport {
    let mut report = ValidationReport::new();
    let get = |key: &str| params.get(key).map(String::as_str).unwrap_or("");

    for spec in schema::file_parameters().filter(|p| p.required) {
        validate_required(&mut report, spec.key, params.get(spec.key).map(String::as_str));
    }

    if has_credential && get("relayhost").is_empty() {
        report.push("relay_password", "relay credentials require a relayhost");
    }

    if get("smtp_sasl_auth_enable") == "yes" && !has_credential {
        report.push(
            "smtp_sasl_auth_enable",
            "SASL authentication enabled but no relay credentials are set",
        );
    }

    let cert = get("smtpd_tls_cert_file");
    let key = get("smtpd_tls_key_file");
    if cert.is_empty() != key.is_empty() {
        report.push(
            if cert.is_empty() {
                "smtpd_tls_cert_file"
            } else {
                "smtpd_tls_key_file"
            },
            "TLS certificate and key must be configured together",
        );
    }

    if get("smtpd_tls_security_level") == "encrypt" && cert.is_empty() {
        report.push(
            "smtpd_tls_security_level",
            "'encrypt' requires smtpd_tls_cert_file and smtpd_tls_key_file",
        );
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(f: fn(&mut ValidationReport, &str, &str), value: &str) -> ValidationReport {
        let mut report = ValidationReport::new();
        f(&mut report, "field", value);
        report
    }

    #[test]
    fn hostnames() {
        assert!(check(validate_hostname, "mail.example.com").is_ok());
        assert!(check(validate_hostname, "mail.example.com.").is_ok());
        assert!(check(validate_hostname, "localhost").is_ok());
        assert!(check(validate_hostname, "a-b.c").is_ok());

        assert!(!check(validate_hostname, "").is_ok());
        assert!(!check(validate_hostname, "-bad.example").is_ok());
        assert!(!check(validate_hostname, "bad-.example").is_ok());
        assert!(!check(validate_hostname, "a..b").is_ok());
        assert!(!check(validate_hostname, "under_score.example").is_ok());
        assert!(!check(validate_hostname, &"a".repeat(64)).is_ok());

        let label = "a".repeat(63);
        let long = format!("{label}.{label}.{label}.{}", "a".repeat(62));
        assert_eq!(long.len(), 254);
        assert!(!check(validate_hostname, &long).is_ok());
        let fits = format!("{label}.{label}.{label}.{}", "a".repeat(61));
        assert!(check(validate_hostname, &fits).is_ok());
    }

    #[test]
    fn emails() {
        assert!(check(validate_email, "postmaster@example.com").is_ok());
        assert!(!check(validate_email, "postmaster").is_ok());
        assert!(!check(validate_email, "@example.com").is_ok());
        assert!(!check(validate_email, "a@-bad").is_ok());
    }

    #[test]
    fn network_lists_are_checked_per_line() {
        assert!(check(validate_network_list, "127.0.0.0/8\n10.0.0.0/8\n[::1]/128").is_ok());
        assert!(check(validate_network_list, "192.0.2.7\n2001:db8::/32").is_ok());
        assert!(check(validate_network_list, "hash:/etc/postfix/network_table").is_ok());

        let report = check(validate_network_list, "127.0.0.0/8\n999.999.0.0/8\n10.0.0.0/33");
        assert_eq!(report.errors().len(), 2);
        assert!(report.errors()[0].message.contains("999.999.0.0/8"));
        assert!(report.errors()[1].message.contains("10.0.0.0/33"));
    }

    #[test]
    fn relay_hosts() {
        for ok in [
            "",
            "[smtp.example.com]:587",
            "smtp.example.com:25",
            "[smtp.example.com]",
            "smtp.example.com",
            "[192.0.2.1]:2525",
            "[ipv6:2001:db8::1]:25",
        ] {
            assert!(check(validate_relay_host, ok).is_ok(), "{ok}");
        }
        for bad in [
            "[smtp.example.com]:0",
            "[smtp.example.com]:70000",
            "[smtp.example.com",
            "[smtp.example.com]x",
            "smtp.example.com:port",
            "bad host:25",
        ] {
            assert!(!check(validate_relay_host, bad).is_ok(), "{bad}");
        }
    }

    #[test]
    fn tls_policies() {
        for ok in ["", "none", "may", "encrypt", "dane", "verify", "secure"] {
            assert!(check(validate_tls_policy, ok).is_ok());
        }
        assert!(!check(validate_tls_policy, "required").is_ok());
        assert!(!check(validate_tls_policy, "MAY").is_ok());
    }

    #[test]
    fn ports() {
        assert!(check(validate_port, "1").is_ok());
        assert!(check(validate_port, "65535").is_ok());
        assert!(!check(validate_port, "0").is_ok());
        assert!(!check(validate_port, "65536").is_ok());
        assert!(!check(validate_port, "-1").is_ok());
    }

    #[test]
    fn changes_accumulate_every_error() {
        let mut changes = ChangeSet::new();
        changes.insert("mynetworks".into(), StagedValue::Set("999.999.0.0/8".into()));
        changes.insert("relayhost".into(), StagedValue::Set("[x]:0".into()));
        changes.insert("not_a_param".into(), StagedValue::Set("1".into()));
        changes.insert("myhostname".into(), StagedValue::Unset);

        let report = validate_changes(&changes);
        assert!(report.has_field("mynetworks"));
        assert!(report.has_field("relayhost"));
        assert!(report.has_field("not_a_param"));
        assert!(report.has_field("myhostname"));
        assert_eq!(report.errors().len(), 4);
    }

    #[test]
    fn credential_errors_never_echo_the_value() {
        let mut changes = ChangeSet::new();
        changes.insert(
            "relay_password".into(),
            StagedValue::Set("user with space:s3cret".into()),
        );
        let report = validate_changes(&changes);
        assert!(report.has_field("relay_password"));
        assert!(!report.to_string().contains("s3cret"));
    }

    #[test]
    fn merged_configuration_rules() {
        let mut params = BTreeMap::new();
        params.insert("myhostname".to_string(), "mail.example.com".to_string());
        assert!(validate_merged(&params, false).is_ok());

        let report = validate_merged(&params, true);
        assert!(report.has_field("relay_password"));

        params.insert("relayhost".into(), "[smtp.example.com]:587".into());
        params.insert("smtp_sasl_auth_enable".into(), "yes".into());
        assert!(validate_merged(&params, true).is_ok());
        assert!(validate_merged(&params, false).has_field("smtp_sasl_auth_enable"));

        params.insert("smtpd_tls_cert_file".into(), "/etc/ssl/mail.pem".into());
        assert!(validate_merged(&params, true).has_field("smtpd_tls_key_file"));

        params.remove("myhostname");
        assert!(validate_merged(&params, true).has_field("myhostname"));
    }
}
