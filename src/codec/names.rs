//! Folder-name translation between the wire and the local view.

use regex::Regex;
use tracing::warn;

use crate::codec::mutf7;
use crate::errors::{SyncError, SyncResult};

/// Strip surrounding double quotes and unescape `\"` and `\\`.
/// Parenthesized lists are not considered quoted.
pub fn dequote(s: &str) -> String {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        s.to_string()
    }
}

pub fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn needs_quoting(s: &str) -> bool {
    s.is_empty() || s.chars().any(|c| matches!(c, ' ' | '(' | ')' | '{' | '}' | '"'))
}

/// Ordered rewrite rules standing in for the original's user-supplied
/// translation function. The first matching pattern wins.
pub struct NameTranslator {
    rules: Vec<(Regex, String)>,
}

impl NameTranslator {
    pub fn identity() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn new(rules: &[(String, String)]) -> SyncResult<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for (pattern, replace) in rules {
            let re = Regex::new(pattern)
                .map_err(|e| SyncError::Config(format!("bad nametrans pattern {pattern:?}: {e}")))?;
            compiled.push((re, replace.clone()));
        }
        Ok(Self { rules: compiled })
    }

    pub fn apply(&self, name: &str) -> String {
        for (re, replace) in &self.rules {
            if re.is_match(name) {
                return re.replace(name, replace.as_str()).into_owned();
            }
        }
        name.to_string()
    }
}

/// The incoming pipeline: dequote, optionally decode modified UTF-7,
/// apply the user translation, and canonicalize a bare separator to
/// the empty (root) name.
pub fn visible_name(
    wire: &str,
    separator: char,
    utf8_names: bool,
    translator: &NameTranslator,
) -> String {
    let mut name = dequote(wire);

    if utf8_names {
        match mutf7::decode(&name) {
            Ok(decoded) => name = decoded,
            Err(e) => {
                warn!(name = %name, error = %e, "folder name is not valid modified utf-7, keeping raw");
            }
        }
    }

    let name = translator.apply(&name);
    if name.chars().collect::<Vec<_>>() == [separator] {
        String::new()
    } else {
        name
    }
}

/// The outgoing direction: re-encode to modified UTF-7. The client
/// library quotes mailbox arguments itself, so this stays unquoted.
pub fn wire_name(visible: &str, utf8_names: bool) -> String {
    if utf8_names {
        mutf7::encode(visible)
    } else {
        visible.to_string()
    }
}

/// Outgoing form for raw protocol text: encoded, and quoted whenever
/// the name contains characters IMAP cannot take bare.
pub fn quoted_wire_name(visible: &str, utf8_names: bool) -> String {
    let encoded = wire_name(visible, utf8_names);
    if needs_quoting(&encoded) {
        quote(&encoded)
    } else {
        encoded
    }
}
