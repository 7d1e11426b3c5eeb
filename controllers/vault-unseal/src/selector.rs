//! Label selector parsing and matching.
//!
//! The selector string is passed verbatim to the API server when listing pods.
//! It is parsed here as well to reject bad specs before any API call and to
//! map pod watch events back to the `VaultUnseal` resources that select them.
//!
//! Supported syntax (comma-separated, all requirements must hold):
//! `key=value`, `key==value`, `key!=value`, `key`, `!key`,
//! `key in (a,b)`, `key notin (a,b)`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("label selector is empty")]
    Empty,

    #[error("invalid label selector requirement '{0}'")]
    Invalid(String),
}

/// One requirement of a selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, values) => labels.get(k).is_some_and(|v| values.contains(v)),
            Requirement::NotIn(k, values) => !labels.get(k).is_some_and(|v| values.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

/// A parsed label selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    raw: String,
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether a label set satisfies every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(SelectorError::Empty);
        }

        let requirements = split_top_level(raw)
            .into_iter()
            .map(parse_requirement)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: raw.to_string(),
            requirements,
        })
    }
}

/// Split on commas that are not inside a `(...)` value list
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_requirement(part: &str) -> Result<Requirement, SelectorError> {
    let part = part.trim();
    let invalid = || SelectorError::Invalid(part.to_string());

    if let Some(key) = part.strip_prefix('!') {
        let key = key.trim();
        return if is_valid_key(key) {
            Ok(Requirement::DoesNotExist(key.to_string()))
        } else {
            Err(invalid())
        };
    }

    if let Some((key, rest)) = part.split_once(char::is_whitespace) {
        let rest = rest.trim_start();
        let (negate, values) = if let Some(v) = rest.strip_prefix("notin") {
            (true, v)
        } else if let Some(v) = rest.strip_prefix("in") {
            (false, v)
        } else {
            // `key = value` with spaces around the operator
            return parse_equality(part).ok_or_else(invalid);
        };
        if !is_valid_key(key) {
            return Err(invalid());
        }
        let values = parse_value_set(values).ok_or_else(invalid)?;
        return Ok(if negate {
            Requirement::NotIn(key.to_string(), values)
        } else {
            Requirement::In(key.to_string(), values)
        });
    }

    if is_valid_key(part) {
        return Ok(Requirement::Exists(part.to_string()));
    }

    parse_equality(part).ok_or_else(invalid)
}

fn parse_equality(part: &str) -> Option<Requirement> {
    let (key, value, negate) = if let Some((k, v)) = part.split_once("!=") {
        (k, v, true)
    } else if let Some((k, v)) = part.split_once("==") {
        (k, v, false)
    } else if let Some((k, v)) = part.split_once('=') {
        (k, v, false)
    } else {
        return None;
    };

    let key = key.trim();
    let value = value.trim();
    if !is_valid_key(key) || !is_valid_value(value) {
        return None;
    }
    Some(if negate {
        Requirement::NotEquals(key.to_string(), value.to_string())
    } else {
        Requirement::Equals(key.to_string(), value.to_string())
    })
}

fn parse_value_set(s: &str) -> Option<BTreeSet<String>> {
    let inner = s.trim().strip_prefix('(')?.strip_suffix(')')?;
    let values: BTreeSet<String> = inner
        .split(',')
        .map(str::trim)
        .map(str::to_string)
        .collect();
    if values.iter().all(|v| is_valid_value(v)) {
        Some(values)
    } else {
        None
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/'))
}

fn is_valid_value(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}
