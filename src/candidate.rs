//! CBU candidate matching over free text.
//!
//! Pure functions, no async. A candidate is any maximal run of digits,
//! hyphens and spaces that collapses to exactly 22 digits. No check-digit
//! validation is performed.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Number of digits in a CBU.
pub const CBU_LEN: usize = 22;

static RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9\- ]+").expect("static regex"));

/// A 22-digit string found in some input. Not checksum-validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Candidate(String);

impl Candidate {
    /// Accept `raw` only if it is exactly 22 ASCII digits.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == CBU_LEN && raw.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Candidate {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("not a {}-digit CBU: {:?}", CBU_LEN, value))
    }
}

impl From<Candidate> for String {
    fn from(c: Candidate) -> Self {
        c.0
    }
}

/// Find every candidate in `text`, in order of occurrence.
///
/// Duplicates are kept.
pub fn find_candidates(text: &str) -> Vec<Candidate> {
    RUN.find_iter(text)
        .map(|m| {
            m.as_str()
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect::<String>()
        })
        .filter(|digits| digits.len() == CBU_LEN)
        .map(Candidate)
        .collect()
}
