//! Comparable package versions.
//!
//! Catalog versions are loose: `1.2`, `v2.0.1`, `3.0.0-beta.2`, `1.0rc1` and
//! date stamps such as `2020.04.17.10.00.00` all occur. Numeric release
//! components compare numerically with trailing zeros ignored, and a
//! prerelease sorts before the release it precedes.

use crate::error::{Result, StowageError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageVersion {
    raw: String,
    release: Vec<u64>,
    pre: Option<semver::Prerelease>,
}

impl PackageVersion {
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim();
        let body = raw
            .strip_prefix('v')
            .or_else(|| raw.strip_prefix('V'))
            .unwrap_or(raw);
        // Build metadata never participates in ordering.
        let body = body.split('+').next().unwrap_or(body);

        let (numbers, suffix) = match body.find('-') {
            Some(idx) => (&body[..idx], Some(body[idx + 1..].to_string())),
            None => split_pep440_suffix(body),
        };

        if numbers.is_empty() {
            return Err(StowageError::InvalidVersion(input.to_string()));
        }
        let release = numbers
            .split('.')
            .map(|part| part.parse::<u64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| StowageError::InvalidVersion(input.to_string()))?;

        let pre = match suffix {
            Some(s) if !s.is_empty() => Some(
                semver::Prerelease::new(&s)
                    .map_err(|_| StowageError::InvalidVersion(input.to_string()))?,
            ),
            _ => None,
        };

        Ok(Self {
            raw: raw.to_string(),
            release,
            pre,
        })
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    pub fn release(&self) -> &[u64] {
        &self.release
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn significant(&self) -> &[u64] {
        let end = self
            .release
            .iter()
            .rposition(|&n| n != 0)
            .map_or(0, |i| i + 1);
        &self.release[..end]
    }
}

/// Split `1.0rc1`, `2.3b2`, `1.0.dev4` into numbers and a prerelease tag.
fn split_pep440_suffix(body: &str) -> (&str, Option<String>) {
    let idx = body
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| i);
    match idx {
        Some(i) => {
            let numbers = body[..i].trim_end_matches('.');
            let tag: String = body[i..]
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '.')
                .collect();
            (numbers, Some(tag))
        }
        None => (body, None),
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.significant()
            .cmp(other.significant())
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PackageVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PackageVersion {}

impl FromStr for PackageVersion {
    type Err = StowageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PackageVersion {
    type Error = StowageError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PackageVersion> for String {
    fn from(value: PackageVersion) -> Self {
        value.raw
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
