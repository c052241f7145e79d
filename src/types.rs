use std::collections::BTreeSet;
use std::fmt;

use chrono::{NaiveDate, Utc};

/// Message identifier inside a folder. Positive values are
/// server-assigned, zero means "saved but the new UID is unknown",
/// negative values are locally allocated and never hit the wire.
pub type Uid = i64;

/// The five standard flags in their single-letter form, in the fixed
/// order used everywhere: S (seen), R (answered), F (flagged),
/// T (deleted), D (draft).
pub const FLAG_LETTERS: [char; 5] = ['S', 'R', 'F', 'T', 'D'];

/// Small set over the five standard flag letters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlagSet(u8);

impl FlagSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    fn bit(letter: char) -> Option<u8> {
        FLAG_LETTERS
            .iter()
            .position(|&l| l == letter)
            .map(|i| 1u8 << i)
    }

    /// Insert a flag letter. Returns false for letters outside the
    /// known alphabet, which are left to the keyword set.
    pub fn insert(&mut self, letter: char) -> bool {
        match Self::bit(letter) {
            Some(b) => {
                self.0 |= b;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, letter: char) {
        if let Some(b) = Self::bit(letter) {
            self.0 &= !b;
        }
    }

    pub fn contains(self, letter: char) -> bool {
        Self::bit(letter).is_some_and(|b| self.0 & b != 0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Flags in `self` that are not in `other`.
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = char> {
        FLAG_LETTERS
            .into_iter()
            .enumerate()
            .filter(move |(i, _)| self.0 & (1 << i) != 0)
            .map(|(_, l)| l)
    }

    /// Parse from the letter form used in the status file and maildir
    /// info suffix. Unknown letters are ignored.
    pub fn from_letters(s: &str) -> Self {
        let mut set = Self::empty();
        for c in s.chars() {
            set.insert(c);
        }
        set
    }

    pub fn to_letters(self) -> String {
        self.iter().collect()
    }

    pub fn single(letter: char) -> Self {
        let mut set = Self::empty();
        set.insert(letter);
        set
    }
}

impl fmt::Debug for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlagSet({})", self.to_letters())
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_letters())
    }
}

impl FromIterator<char> for FlagSet {
    fn from_iter<I: IntoIterator<Item = char>>(iter: I) -> Self {
        let mut set = Self::empty();
        for c in iter {
            set.insert(c);
        }
        set
    }
}

/// Cached per-message metadata, everything the sync passes need short
/// of the body itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageMeta {
    pub flags: FlagSet,
    pub keywords: BTreeSet<String>,
    pub internal_time: i64,
}

impl MessageMeta {
    pub fn new(flags: FlagSet, keywords: BTreeSet<String>, internal_time: i64) -> Self {
        Self {
            flags,
            keywords,
            internal_time,
        }
    }
}

/// Window limits applied when a folder loads its message list.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListFilter {
    pub min_date: Option<NaiveDate>,
    pub min_uid: Option<Uid>,
    pub max_size: Option<u32>,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
