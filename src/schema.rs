//! Declarative parameter schema.
//!
//! Every parameter the engine manages is described exactly once here:
//! its key, category, the validator that applies to it, and whether it is
//! a list or a secret-bearing credential.  Validation, merge, diff and
//! masking all read this table, so adding a parameter is a one-line change.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StageError};

/// Placeholder shown wherever a secret-bearing value would otherwise appear.
pub const SECRET_PLACEHOLDER: &str = "********";

/// The category a parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    General,
    Relay,
    Tls,
    Authentication,
    Restrictions,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::General => "general",
            Category::Relay => "relay",
            Category::Tls => "tls",
            Category::Authentication => "authentication",
            Category::Restrictions => "restrictions",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "general" => Ok(Category::General),
            "relay" => Ok(Category::Relay),
            "tls" => Ok(Category::Tls),
            "authentication" => Ok(Category::Authentication),
            "restrictions" => Ok(Category::Restrictions),
            other => Err(StageError::SerializationError(format!(
                "unknown parameter category '{other}'"
            ))),
        }
    }
}

/// Which validator a parameter's value goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// RFC-1123 host or domain name.
    Hostname,
    /// Hostname, or one of the `$myhostname` / `$mydomain` references.
    Origin,
    /// Local part (`postmaster`) or a full address.
    Recipient,
    /// `all`, `loopback-only`, or addresses / hostnames.
    Interfaces,
    /// `all`, `ipv4`, `ipv6`.
    Protocols,
    NonNegativeInt,
    /// IP addresses, CIDR networks or `type:/path` lookup tables.
    Networks,
    RelayHost,
    Domains,
    TlsPolicy,
    AbsolutePath,
    YesNo,
    Text,
    Restrictions,
    /// `user:password` for relay authentication.
    Credential,
}

/// One managed parameter.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub key: &'static str,
    pub category: Category,
    pub kind: ValueKind,
    pub required: bool,
    /// Multi-line in the UI, comma-separated in the MTA file.
    pub list: bool,
    /// Stored only encrypted; written to the credential file, never to the main file.
    pub secret: bool,
    pub description: &'static str,
}

const fn param(key: &'static str, category: Category, kind: ValueKind) -> ParamSpec {
    ParamSpec {
        key,
        category,
        kind,
        required: false,
        list: false,
        secret: false,
        description: "",
    }
}

const fn describe(mut spec: ParamSpec, description: &'static str) -> ParamSpec {
    spec.description = description;
    spec
}

const fn required(mut spec: ParamSpec) -> ParamSpec {
    spec.required = true;
    spec
}

const fn list(mut spec: ParamSpec) -> ParamSpec {
    spec.list = true;
    spec
}

const fn secret(mut spec: ParamSpec) -> ParamSpec {
    spec.secret = true;
    spec
}

use Category::*;
use ValueKind as K;

/// Every parameter the engine manages.
pub static PARAMETERS: &[ParamSpec] = &[
    describe(
        required(param("myhostname", General, K::Hostname)),
        "Fully-qualified host name of this mail system",
    ),
    describe(param("mydomain", General, K::Hostname), "Local internet domain name"),
    describe(
        param("myorigin", General, K::Origin),
        "Domain appended to locally-posted mail",
    ),
    describe(
        list(param("inet_interfaces", General, K::Interfaces)),
        "Network interfaces to receive mail on",
    ),
    describe(
        param("inet_protocols", General, K::Protocols),
        "Internet protocols to use",
    ),
    describe(
        param("message_size_limit", General, K::NonNegativeInt),
        "Maximal message size in bytes (0 = unlimited)",
    ),
    describe(
        param("bounce_notice_recipient", General, K::Recipient),
        "Recipient of postmaster bounce notices",
    ),
    describe(
        list(param("mynetworks", Relay, K::Networks)),
        "Trusted client networks allowed to relay",
    ),
    describe(
        param("relayhost", Relay, K::RelayHost),
        "Upstream host for outbound mail ([host]:port)",
    ),
    describe(
        list(param("relay_domains", Relay, K::Domains)),
        "Destination domains this system relays to",
    ),
    describe(
        param("smtp_tls_security_level", Tls, K::TlsPolicy),
        "Outbound TLS policy",
    ),
    describe(
        param("smtpd_tls_security_level", Tls, K::TlsPolicy),
        "Inbound TLS policy",
    ),
    describe(
        param("smtpd_tls_cert_file", Tls, K::AbsolutePath),
        "Server certificate file",
    ),
    describe(
        param("smtpd_tls_key_file", Tls, K::AbsolutePath),
        "Server private key file",
    ),
    describe(
        param("smtp_sasl_auth_enable", Authentication, K::YesNo),
        "Authenticate to the relay host",
    ),
    describe(
        param("smtp_sasl_security_options", Authentication, K::Text),
        "SASL mechanism restrictions",
    ),
    describe(
        secret(param("relay_password", Authentication, K::Credential)),
        "Relay credentials as user:password",
    ),
    describe(
        param("smtpd_helo_required", Restrictions, K::YesNo),
        "Require HELO/EHLO before MAIL FROM",
    ),
    describe(
        list(param("smtpd_recipient_restrictions", Restrictions, K::Restrictions)),
        "Restrictions applied at RCPT TO",
    ),
    describe(
        list(param("smtpd_client_restrictions", Restrictions, K::Restrictions)),
        "Restrictions applied at connect",
    ),
    describe(
        param("disable_vrfy_command", Restrictions, K::YesNo),
        "Disable the SMTP VRFY command",
    ),
];

/// Look up a parameter by key.
pub fn lookup(key: &str) -> Option<&'static ParamSpec> {
    PARAMETERS.iter().find(|p| p.key == key)
}

/// Parameters that live in the MTA's main configuration file.
pub fn file_parameters() -> impl Iterator<Item = &'static ParamSpec> {
    PARAMETERS.iter().filter(|p| !p.secret)
}

/// A proposed value for one parameter.
///
/// `Unset` removes the parameter from the configuration file; an empty
/// `Set("")` writes the parameter with an empty value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagedValue {
    Set(String),
    Unset,
}

impl StagedValue {
    pub fn as_set(&self) -> Option<&str> {
        match self {
            StagedValue::Set(v) => Some(v),
            StagedValue::Unset => None,
        }
    }
}

/// A partial parameter set submitted for staging or validation.
pub type ChangeSet = BTreeMap<String, StagedValue>;

impl ParamSpec {
    /// The value to show for this parameter outside the engine: secrets
    /// are reduced to the placeholder.
    pub fn display_value(&self, value: Option<&str>) -> Option<String> {
        match value {
            None => None,
            Some(_) if self.secret => Some(SECRET_PLACEHOLDER.to_string()),
            Some(v) => Some(v.to_string()),
        }
    }

    /// Normalize user input: list values become one trimmed entry per line.
    pub fn normalize(&self, value: &str) -> String {
        if self.list {
            value
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            value.trim().to_string()
        }
    }

    /// Convert a UI value (one entry per line) to the MTA file form.
    pub fn to_file_value(&self, value: &str) -> String {
        if self.list {
            value
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            value.to_string()
        }
    }

    /// Convert an MTA file value back to the UI form.
    ///
    /// Restriction entries may carry an argument after a space
    /// (`reject_rbl_client zen.example`), so only commas separate them.
    pub fn from_file_value(&self, value: &str) -> String {
        if !self.list {
            return value.trim().to_string();
        }
        let split_on_space = !matches!(self.kind, ValueKind::Restrictions);
        value
            .split(|c: char| c == ',' || (split_on_space && c.is_whitespace()))
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_are_unique() {
        let keys: HashSet<&str> = PARAMETERS.iter().map(|p| p.key).collect();
        assert_eq!(keys.len(), PARAMETERS.len());
    }

    #[test]
    fn only_credentials_are_secret() {
        for p in PARAMETERS {
            assert_eq!(p.secret, p.kind == ValueKind::Credential, "{}", p.key);
        }
    }

    #[test]
    fn category_roundtrips_through_str() {
        for c in [
            Category::General,
            Category::Relay,
            Category::Tls,
            Category::Authentication,
            Category::Restrictions,
        ] {
            assert_eq!(c.as_str().parse::<Category>().unwrap(), c);
        }
        assert!("bogus".parse::<Category>().is_err());
    }

    #[test]
    fn list_values_convert_to_and_from_file_form() {
        let spec = lookup("mynetworks").unwrap();
        assert_eq!(
            spec.to_file_value("127.0.0.0/8\n 10.0.0.0/8 \n\n"),
            "127.0.0.0/8, 10.0.0.0/8"
        );
        assert_eq!(
            spec.from_file_value("127.0.0.0/8, 10.0.0.0/8 [::1]/128"),
            "127.0.0.0/8\n10.0.0.0/8\n[::1]/128"
        );
    }

    #[test]
    fn restriction_arguments_survive_file_form() {
        let spec = lookup("smtpd_recipient_restrictions").unwrap();
        let ui = "permit_mynetworks\nreject_rbl_client zen.example.org";
        let file = spec.to_file_value(ui);
        assert_eq!(file, "permit_mynetworks, reject_rbl_client zen.example.org");
        assert_eq!(spec.from_file_value(&file), ui);
    }

    #[test]
    fn secret_values_are_masked() {
        let spec = lookup("relay_password").unwrap();
        assert_eq!(
            spec.display_value(Some("user:hunter2")).as_deref(),
            Some(SECRET_PLACEHOLDER)
        );
        assert_eq!(spec.display_value(None), None);

        let plain = lookup("relayhost").unwrap();
        assert_eq!(
            plain.display_value(Some("[mx.example.com]:587")).as_deref(),
            Some("[mx.example.com]:587")
        );
    }
}
