//! Version requirement expressions.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{VersionError, VersionResult};
use crate::version::{parse_numeric, parse_pre, Version};

/// A comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// The pessimistic operator: `~> M.N` spans `[M.N.0, M+1.0.0)` and
    /// `~> M.N.P` spans `[M.N.P, M.N+1.0)`.
    Tilde,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "==",
            Op::Neq => "!=",
            Op::Gt => ">",
            Op::Gte => ">=",
            Op::Lt => "<",
            Op::Lte => "<=",
            Op::Tilde => "~>",
        }
    }
}

/// A single `(operator, version)` constraint.
///
/// The parse of `~> 1.2` is kept distinct from `~> 1.2.0`: the former allows
/// the whole `1.x` series while the latter only the `1.2.x` series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub op: Op,
    pub version: Version,
    patch_specified: bool,
}

impl Constraint {
    fn matches(&self, version: &Version) -> bool {
        match self.op {
            Op::Eq => version == &self.version,
            Op::Neq => version != &self.version,
            Op::Gt => version > &self.version,
            Op::Gte => version >= &self.version,
            Op::Lt => version < &self.version,
            Op::Lte => version <= &self.version,
            Op::Tilde => {
                let upper = if self.patch_specified {
                    Version::new(self.version.major, self.version.minor + 1, 0)
                } else {
                    Version::new(self.version.major + 1, 0, 0)
                };
                version >= &self.version && version < &upper
            }
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}", self.op.as_str(), self.version.major, self.version.minor)?;
        if self.patch_specified {
            write!(f, ".{}", self.version.patch)?;
            for (i, id) in self.version.pre.iter().enumerate() {
                f.write_str(if i == 0 { "-" } else { "." })?;
                write!(f, "{}", id)?;
            }
        }
        Ok(())
    }
}

/// A conjunction of version constraints.
///
/// The null requirement ([`Requirement::any`]) matches every version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    constraints: Vec<Constraint>,
}

impl Requirement {
    /// The null requirement: matches any version.
    pub fn any() -> Self {
        Self {
            constraints: Vec::new(),
        }
    }

    /// Whether this is the null requirement.
    pub fn is_any(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Parse a requirement: one or more constraints joined by `and` or `,`.
    pub fn parse(input: &str) -> VersionResult<Self> {
        let invalid = || VersionError::InvalidRequirement {
            input: input.to_string(),
        };

        let text = input.trim();
        if text.is_empty() {
            return Err(invalid());
        }

        let mut constraints = Vec::new();
        for part in text.split(" and ").flat_map(|p| p.split(',')) {
            let part = part.trim();
            if part.is_empty() {
                return Err(invalid());
            }
            constraints.push(parse_constraint(part).ok_or_else(invalid)?);
        }

        Ok(Self { constraints })
    }

    /// Whether `version` satisfies every constraint.
    ///
    /// A pre-release version is only eligible when some constraint names a
    /// pre-release with the same `(major, minor, patch)` triple.
    pub fn matches(&self, version: &Version) -> bool {
        if self.constraints.is_empty() {
            return true;
        }
        if version.is_pre() {
            let eligible = self.constraints.iter().any(|c| {
                c.version.is_pre() && c.version.triple() == version.triple()
            });
            if !eligible {
                return false;
            }
        }
        self.constraints.iter().all(|c| c.matches(version))
    }

    /// The individual constraints.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }
}

fn parse_constraint(part: &str) -> Option<Constraint> {
    let (op, rest) = if let Some(rest) = part.strip_prefix("~>") {
        (Op::Tilde, rest)
    } else if let Some(rest) = part.strip_prefix(">=") {
        (Op::Gte, rest)
    } else if let Some(rest) = part.strip_prefix("<=") {
        (Op::Lte, rest)
    } else if let Some(rest) = part.strip_prefix("!=") {
        (Op::Neq, rest)
    } else if let Some(rest) = part.strip_prefix("==") {
        (Op::Eq, rest)
    } else if let Some(rest) = part.strip_prefix('>') {
        (Op::Gt, rest)
    } else if let Some(rest) = part.strip_prefix('<') {
        (Op::Lt, rest)
    } else if let Some(rest) = part.strip_prefix('=') {
        (Op::Eq, rest)
    } else {
        (Op::Eq, part)
    };

    let (version, patch_specified) = parse_partial_version(rest.trim())?;
    Some(Constraint {
        op,
        version,
        patch_specified,
    })
}

/// Parse `M.N` or `M.N.P[-pre]`; requirements never carry build metadata.
fn parse_partial_version(text: &str) -> Option<(Version, bool)> {
    if text.is_empty() || text.contains('+') {
        return None;
    }

    let (triple, pre_text) = match text.split_once('-') {
        Some((triple, pre)) => (triple, Some(pre)),
        None => (text, None),
    };

    let mut parts = triple.split('.');
    let major = parse_numeric(parts.next())?;
    let minor = parse_numeric(parts.next())?;
    let patch = parts.next();
    if parts.next().is_some() {
        return None;
    }

    match patch {
        Some(patch) => {
            let patch = parse_numeric(Some(patch))?;
            let pre = match pre_text {
                Some(pre) => parse_pre(pre)?,
                None => Vec::new(),
            };
            let mut version = Version::new(major, minor, patch);
            version.pre = pre;
            Some((version, true))
        }
        None => {
            // A pre-release tag needs the full triple to anchor to.
            if pre_text.is_some() {
                return None;
            }
            Some((Version::new(major, minor, 0), false))
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.constraints.is_empty() {
            return f.write_str("*");
        }
        for (i, constraint) in self.constraints.iter().enumerate() {
            if i > 0 {
                f.write_str(" and ")?;
            }
            write!(f, "{}", constraint)?;
        }
        Ok(())
    }
}

impl FromStr for Requirement {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Requirement::parse(s)
    }
}

impl Serialize for Requirement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Requirement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Requirement::parse(&text).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(text: &str) -> Requirement {
        Requirement::parse(text).unwrap()
    }

    fn v(text: &str) -> Version {
        Version::parse(text).unwrap()
    }

    #[test]
    fn test_parse_operators() {
        for (text, op) in [
            ("== 1.0.0", Op::Eq),
            ("= 1.0.0", Op::Eq),
            ("1.0.0", Op::Eq),
            ("!= 1.0.0", Op::Neq),
            ("> 1.0.0", Op::Gt),
            (">= 1.0.0", Op::Gte),
            ("< 1.0.0", Op::Lt),
            ("<= 1.0.0", Op::Lte),
            ("~> 1.0.0", Op::Tilde),
        ] {
            assert_eq!(req(text).constraints()[0].op, op, "for {:?}", text);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in ["", ">=", "~> 1", "1.2.3.4", ">= 1.2 and", "~> 1.2-rc", "1.0.0+b5"] {
            assert!(
                Requirement::parse(input).is_err(),
                "expected parse failure for {:?}",
                input
            );
        }
    }

    #[test]
    fn test_tilde_two_component_window() {
        let r = req("~> 2.1");
        assert!(!r.matches(&v("2.0.9")));
        assert!(r.matches(&v("2.1.0")));
        assert!(r.matches(&v("2.9.3")));
        assert!(!r.matches(&v("3.0.0")));
    }

    #[test]
    fn test_tilde_three_component_window() {
        let r = req("~> 2.1.3");
        assert!(!r.matches(&v("2.1.2")));
        assert!(r.matches(&v("2.1.3")));
        assert!(r.matches(&v("2.1.9")));
        assert!(!r.matches(&v("2.2.0")));
    }

    #[test]
    fn test_tilde_parses_stay_distinct() {
        assert!(req("~> 2.1").matches(&v("2.5.0")));
        assert!(!req("~> 2.1.0").matches(&v("2.5.0")));
    }

    #[test]
    fn test_conjunction() {
        let r = req(">= 1.2.0 and < 2.0.0");
        assert!(!r.matches(&v("1.1.9")));
        assert!(r.matches(&v("1.2.0")));
        assert!(r.matches(&v("1.9.9")));
        assert!(!r.matches(&v("2.0.0")));

        // Comma-separated form is the same conjunction.
        assert_eq!(r, req(">= 1.2.0, < 2.0.0"));
    }

    #[test]
    fn test_pre_release_gate() {
        // Pre-releases never match a release-only requirement...
        assert!(!req(">= 1.0.0").matches(&v("2.0.0-rc.1")));
        assert!(!req("~> 2.0").matches(&v("2.1.0-beta")));

        // ...and only match when the requirement names the same triple.
        let r = req(">= 2.0.0-rc.0");
        assert!(r.matches(&v("2.0.0-rc.1")));
        assert!(!r.matches(&v("2.1.0-rc.1")));
        assert!(r.matches(&v("2.1.0")));
    }

    #[test]
    fn test_null_requirement() {
        let r = Requirement::any();
        assert!(r.is_any());
        assert!(r.matches(&v("0.0.1")));
        assert!(r.matches(&v("99.0.0")));
        assert!(r.matches(&v("1.0.0-rc.1")));
    }

    #[test]
    fn test_display_roundtrip() {
        for input in ["~> 1.2", "~> 1.2.3", ">= 1.0.0 and < 2.0.0", "== 2.0.0-rc.1"] {
            let r = req(input);
            assert_eq!(Requirement::parse(&r.to_string()).unwrap(), r);
        }
        assert_eq!(req("~> 1.2").to_string(), "~> 1.2");
        assert_eq!(req("1.2.3").to_string(), "== 1.2.3");
    }

    #[test]
    fn test_match_deterministic() {
        let r = req("~> 1.4");
        let version = v("1.4.2");
        assert_eq!(r.matches(&version), r.matches(&version));
    }
}
