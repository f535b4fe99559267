//! Path exclusion filter
//!
//! A filter is a list of regular expressions. A pathname is excluded when any
//! expression matches a prefix of it, so `/tmp` excludes `/tmp` and
//! everything below (and also `/tmpfoo`; write `/tmp(/|$)` to be strict).

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::errors::DomainError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Filter {
    lines: Vec<String>,
    regexes: Vec<Regex>,
}

impl Filter {
    /// Compiles filter lines; blank lines are ignored
    pub fn new<I, S>(lines: I) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            let regex = Regex::new(&format!("^(?:{line})")).map_err(|e| {
                DomainError::InvalidPattern {
                    pattern: line.to_string(),
                    reason: e.to_string(),
                }
            })?;
            filter.lines.push(line.to_string());
            filter.regexes.push(regex);
        }
        Ok(filter)
    }

    /// Returns true if `path` is excluded
    pub fn matches(&self, path: &str) -> bool {
        self.regexes.iter().any(|regex| regex.is_match(path))
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.lines == other.lines
    }
}

impl Eq for Filter {}

impl TryFrom<Vec<String>> for Filter {
    type Error = DomainError;

    fn try_from(lines: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(lines)
    }
}

impl From<Filter> for Vec<String> {
    fn from(filter: Filter) -> Self {
        filter.lines
    }
}
