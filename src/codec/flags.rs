use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::types::FlagSet;

/// Fixed bijection between server flag tokens and their single-letter
/// form. Everything outside this table is a keyword.
pub const FLAG_MAP: [(&str, char); 5] = [
    ("\\Seen", 'S'),
    ("\\Answered", 'R'),
    ("\\Flagged", 'F'),
    ("\\Deleted", 'T'),
    ("\\Draft", 'D'),
];

fn letter_for(token: &str) -> Option<char> {
    FLAG_MAP
        .iter()
        .find(|(t, _)| t.eq_ignore_ascii_case(token))
        .map(|&(_, l)| l)
}

fn token_for(letter: char) -> Option<&'static str> {
    FLAG_MAP.iter().find(|&&(_, l)| l == letter).map(|&(t, _)| t)
}

/// Split a server flag list (with or without the surrounding parens)
/// into the known flag set and the leftover keywords. Unknown tokens,
/// including unrecognized `\`-prefixed ones, land in the keyword set.
pub fn parse_server_flags(s: &str) -> (FlagSet, BTreeSet<String>) {
    let inner = s.trim();
    let inner = inner
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .unwrap_or(inner);

    let mut flags = FlagSet::empty();
    let mut keywords = BTreeSet::new();
    for token in inner.split_ascii_whitespace() {
        match letter_for(token) {
            Some(letter) => {
                flags.insert(letter);
            }
            None => {
                keywords.insert(token.to_string());
            }
        }
    }
    (flags, keywords)
}

/// Render a flag set as a parenthesized server list, sorted
/// lexicographically so the output is deterministic.
pub fn render_server_flags(flags: FlagSet) -> String {
    let mut tokens: Vec<&str> = flags.iter().filter_map(token_for).collect();
    tokens.sort_unstable();
    format!("({})", tokens.join(" "))
}

/// Convert the typed flags of an async-imap FETCH item.
pub fn from_imap_flags<'a, I>(items: I) -> (FlagSet, BTreeSet<String>)
where
    I: IntoIterator<Item = async_imap::types::Flag<'a>>,
{
    use async_imap::types::Flag;

    let mut flags = FlagSet::empty();
    let mut keywords = BTreeSet::new();
    for item in items {
        match item {
            Flag::Seen => {
                flags.insert('S');
            }
            Flag::Answered => {
                flags.insert('R');
            }
            Flag::Flagged => {
                flags.insert('F');
            }
            Flag::Deleted => {
                flags.insert('T');
            }
            Flag::Draft => {
                flags.insert('D');
            }
            Flag::Custom(kw) => {
                keywords.insert(kw.to_string());
            }
            // \Recent and friends are session noise, not state.
            _ => {}
        }
    }
    (flags, keywords)
}

/// Apply a destination's keyword map. Keywords without a mapping are
/// warned about and skipped for that destination only.
pub fn map_keywords(
    keywords: &BTreeSet<String>,
    keyword_map: Option<&BTreeMap<String, char>>,
) -> FlagSet {
    let Some(map) = keyword_map else {
        return FlagSet::empty();
    };

    let mut mapped = FlagSet::empty();
    for kw in keywords {
        match map.get(kw) {
            Some(&letter) => {
                mapped.insert(letter);
            }
            None => {
                warn!(keyword = %kw, "keyword has no mapping for this destination, skipping");
            }
        }
    }
    mapped
}
