//! Line-preserving reader/writer for the MTA's `key = value` configuration file.
//!
//! The grammar is owned by the MTA; this module only understands enough of
//! it to read and replace parameter values.  Comments, blank lines,
//! unmanaged parameters and untouched entries are written back exactly as
//! they were read, so re-rendering an unmodified document is byte-identical.
//!
//! ```text
//! # comment
//! myhostname = mail.example.com
//! mynetworks = 127.0.0.0/8,
//!     10.0.0.0/8          <- continuation line (leading whitespace)
//! ```

use std::collections::BTreeMap;

use crate::schema::{self, StagedValue};

#[derive(Debug, Clone)]
enum Line {
    /// Comment, blank or unparseable line, kept verbatim.
    Raw(String),
    Entry {
        key: String,
        value: String,
        /// Original text including continuation lines; `None` once modified.
        raw: Option<Vec<String>>,
    },
}

/// A parsed configuration document.
#[derive(Debug, Clone, Default)]
pub struct MainConfig {
    lines: Vec<Line>,
    trailing_newline: bool,
}

impl MainConfig {
    /// Parse configuration text.  Parsing never fails; lines that are not
    /// `key = value` are carried through untouched.
    pub fn parse(text: &str) -> Self {
        let mut lines: Vec<Line> = Vec::new();

        for line in text.lines() {
            let is_continuation = line.starts_with(|c: char| c == ' ' || c == '\t')
                && !line.trim().is_empty()
                && !line.trim_start().starts_with('#');

            if is_continuation {
                if let Some(Line::Entry {
                    value,
                    raw: Some(raw),
                    ..
                }) = lines.last_mut()
                {
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(line.trim());
                    raw.push(line.to_string());
                    continue;
                }
            }

            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') || is_continuation {
                lines.push(Line::Raw(line.to_string()));
                continue;
            }

            match line.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => lines.push(Line::Entry {
                    key: key.trim().to_string(),
                    value: value.trim().to_string(),
                    raw: Some(vec![line.to_string()]),
                }),
                _ => lines.push(Line::Raw(line.to_string())),
            }
        }

        Self {
            lines,
            trailing_newline: text.is_empty() || text.ends_with('\n'),
        }
    }

    /// Value of `key` in file form.  The last occurrence wins, as in the MTA.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Entry { key: k, value, .. } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Set `key` to `value` (file form).  The first occurrence is rewritten
    /// in place and any later duplicates are dropped; a new key is appended.
    pub fn set(&mut self, key: &str, value: &str) {
        let mut replaced = false;
        self.lines.retain_mut(|line| match line {
            Line::Entry {
                key: k,
                value: v,
                raw,
            } if k == key => {
                if replaced {
                    return false;
                }
                replaced = true;
                if v != value {
                    *v = value.to_string();
                    *raw = None;
                }
                true
            }
            _ => true,
        });

        if !replaced {
            self.lines.push(Line::Entry {
                key: key.to_string(),
                value: value.to_string(),
                raw: None,
            });
        }
    }

    /// Remove every occurrence of `key`.  Returns whether anything was removed.
    pub fn unset(&mut self, key: &str) -> bool {
        let before = self.lines.len();
        self.lines
            .retain(|line| !matches!(line, Line::Entry { key: k, .. } if k == key));
        before != self.lines.len()
    }

    /// Apply a staged value for a schema parameter, converting list values
    /// from one-per-line to the file's comma-separated form.
    pub fn apply(&mut self, key: &str, value: &StagedValue) {
        match value {
            StagedValue::Set(v) => {
                let file_value = match schema::lookup(key) {
                    Some(spec) => spec.to_file_value(v),
                    None => v.clone(),
                };
                self.set(key, &file_value);
            }
            StagedValue::Unset => {
                self.unset(key);
            }
        }
    }

    /// Current values of every managed file parameter, in UI form.
    pub fn managed_values(&self) -> BTreeMap<String, String> {
        schema::file_parameters()
            .filter_map(|spec| {
                self.get(spec.key)
                    .map(|v| (spec.key.to_string(), spec.from_file_value(v)))
            })
            .collect()
    }

    /// Render the document back to text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Raw(text) => {
                    out.push_str(text);
                    out.push('\n');
                }
                Line::Entry {
                    raw: Some(raw), ..
                } => {
                    for text in raw {
                        out.push_str(text);
                        out.push('\n');
                    }
                }
                Line::Entry {
                    key,
                    value,
                    raw: None,
                } => {
                    if value.is_empty() {
                        out.push_str(&format!("{key} =\n"));
                    } else {
                        out.push_str(&format!("{key} = {value}\n"));
                    }
                }
            }
        }
        if !self.trailing_newline && out.ends_with('\n') {
            out.pop();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Global Postfix configuration
myhostname = mail.example.com
mynetworks = 127.0.0.0/8,
    10.0.0.0/8

# outbound
relayhost =
compatibility_level = 3.6
";

    #[test]
    fn unmodified_document_renders_identically() {
        let doc = MainConfig::parse(SAMPLE);
        assert_eq!(doc.render(), SAMPLE);

        let no_newline = "myhostname = a.example";
        assert_eq!(MainConfig::parse(no_newline).render(), no_newline);
    }

    #[test]
    fn continuation_lines_join_into_one_value() {
        let doc = MainConfig::parse(SAMPLE);
        assert_eq!(doc.get("mynetworks"), Some("127.0.0.0/8, 10.0.0.0/8"));
        assert_eq!(doc.get("relayhost"), Some(""));
        assert_eq!(doc.get("missing"), None);
    }

    #[test]
    fn set_rewrites_in_place_and_keeps_other_lines() {
        let mut doc = MainConfig::parse(SAMPLE);
        doc.set("relayhost", "[smtp.example.com]:587");
        let out = doc.render();
        assert!(out.contains("relayhost = [smtp.example.com]:587\n"));
        assert!(out.contains("compatibility_level = 3.6\n"));
        assert!(out.starts_with("# Global Postfix configuration\n"));
    }

    #[test]
    fn set_appends_new_keys_and_collapses_duplicates() {
        let mut doc = MainConfig::parse("a = 1\nb = 2\na = 3\n");
        assert_eq!(doc.get("a"), Some("3"));
        doc.set("a", "4");
        doc.set("c", "5");
        assert_eq!(doc.render(), "a = 4\nb = 2\nc = 5\n");
    }

    #[test]
    fn unset_removes_entry_and_continuations() {
        let mut doc = MainConfig::parse(SAMPLE);
        assert!(doc.unset("mynetworks"));
        assert!(!doc.unset("mynetworks"));
        let out = doc.render();
        assert!(!out.contains("mynetworks"));
        assert!(!out.contains("10.0.0.0/8"));
    }

    #[test]
    fn apply_converts_list_values() {
        let mut doc = MainConfig::parse(SAMPLE);
        doc.apply(
            "mynetworks",
            &StagedValue::Set("127.0.0.0/8\n192.168.0.0/16".into()),
        );
        assert_eq!(doc.get("mynetworks"), Some("127.0.0.0/8, 192.168.0.0/16"));

        let managed = doc.managed_values();
        assert_eq!(managed["mynetworks"], "127.0.0.0/8\n192.168.0.0/16");
        assert_eq!(managed["myhostname"], "mail.example.com");
        assert!(!managed.contains_key("compatibility_level"));
    }

    #[test]
    fn setting_the_same_value_keeps_original_formatting() {
        let text = "myhostname   =   mail.example.com\n";
        let mut doc = MainConfig::parse(text);
        doc.set("myhostname", "mail.example.com");
        assert_eq!(doc.render(), text);
    }
}
