//! Semantic version values.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{VersionError, VersionResult};

/// A single pre-release identifier.
///
/// Identifiers consisting solely of digits compare numerically; all others
/// compare lexicographically, and numeric identifiers sort below alphanumeric
/// ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Numeric(u64),
    Alpha(String),
}

impl Identifier {
    fn parse(text: &str) -> Option<Identifier> {
        if text.is_empty() {
            return None;
        }
        if text.bytes().all(|b| b.is_ascii_digit()) {
            // Numeric identifiers must not carry leading zeros.
            if text.len() > 1 && text.starts_with('0') {
                return None;
            }
            return text.parse().ok().map(Identifier::Numeric);
        }
        if text
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Some(Identifier::Alpha(text.to_string()));
        }
        None
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Identifier::Numeric(a), Identifier::Numeric(b)) => a.cmp(b),
            (Identifier::Numeric(_), Identifier::Alpha(_)) => Ordering::Less,
            (Identifier::Alpha(_), Identifier::Numeric(_)) => Ordering::Greater,
            (Identifier::Alpha(a), Identifier::Alpha(b)) => a.cmp(b),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Numeric(n) => write!(f, "{}", n),
            Identifier::Alpha(s) => f.write_str(s),
        }
    }
}

/// A semantic version.
///
/// Ordering follows semver precedence: numeric fields by value, a present
/// pre-release sequence sorts below an absent one, and build metadata is
/// ignored for ordering but preserved textually.
#[derive(Debug, Clone)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Vec<Identifier>,
    pub build: Option<String>,
}

impl Version {
    /// Construct a release version without pre-release or build metadata.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: Vec::new(),
            build: None,
        }
    }

    /// Parse a full `major.minor.patch[-pre][+build]` version.
    pub fn parse(input: &str) -> VersionResult<Self> {
        let invalid = || VersionError::InvalidVersion {
            input: input.to_string(),
        };

        let text = input.trim();
        if text.is_empty() {
            return Err(invalid());
        }

        let (rest, build) = match text.split_once('+') {
            Some((rest, build)) if !build.is_empty() => (rest, Some(build.to_string())),
            Some(_) => return Err(invalid()),
            None => (text, None),
        };

        let (triple, pre_text) = match rest.split_once('-') {
            Some((triple, pre)) => (triple, Some(pre)),
            None => (rest, None),
        };

        let mut parts = triple.split('.');
        let major = parse_numeric(parts.next()).ok_or_else(invalid)?;
        let minor = parse_numeric(parts.next()).ok_or_else(invalid)?;
        let patch = parse_numeric(parts.next()).ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        let pre = match pre_text {
            Some(pre) => parse_pre(pre).ok_or_else(invalid)?,
            None => Vec::new(),
        };

        Ok(Self {
            major,
            minor,
            patch,
            pre,
            build,
        })
    }

    /// The `(major, minor, patch)` triple.
    pub fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }

    /// Whether this version carries a pre-release sequence.
    pub fn is_pre(&self) -> bool {
        !self.pre.is_empty()
    }
}

pub(crate) fn parse_numeric(part: Option<&str>) -> Option<u64> {
    let part = part?;
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if part.len() > 1 && part.starts_with('0') {
        return None;
    }
    part.parse().ok()
}

pub(crate) fn parse_pre(text: &str) -> Option<Vec<Identifier>> {
    text.split('.').map(Identifier::parse).collect()
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        // Build metadata does not participate in precedence.
        self.triple() == other.triple() && self.pre == other.pre
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.triple().hash(state);
        self.pre.hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.triple().cmp(&other.triple()) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match (self.pre.is_empty(), other.pre.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.pre.cmp(&other.pre),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        for (i, id) in self.pre.iter().enumerate() {
            f.write_str(if i == 0 { "-" } else { "." })?;
            write!(f, "{}", id)?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Version::parse(&text).map_err(de::Error::custom)
    }
}
