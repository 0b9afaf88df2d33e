use std::{fmt, str::FromStr};

use smol_str::SmolStr;

pub type Version = serde_semver::semver::Version;

/// Parses a tag name as a semantic version.
///
/// Accepts an optional leading `v`/`V` and pads missing minor or patch
/// components with zero, so `v1`, `1.2` and `1.2.0` are all versions.
pub fn parse_tag(tag: &str) -> Option<Version> {
    let trimmed = tag.strip_prefix(['v', 'V']).unwrap_or(tag);
    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }

    let (core, rest) = match trimmed.find(['-', '+']) {
        Some(index) => trimmed.split_at(index),
        None => (trimmed, ""),
    };
    let components: Vec<&str> = core.split('.').collect();
    if components.is_empty()
        || components.len() > 3
        || components
            .iter()
            .any(|c| c.is_empty() || !c.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }
    let mut padded = components.join(".");
    for _ in components.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(rest);
    Version::parse(&padded).ok()
}

/// A predicate over the available versions of one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionConstraint {
    Any,
    Exact(Version),
    AtLeast(Version),
    /// At least the given version, without crossing the next
    /// compatibility boundary (major, or minor for `0.x`).
    CompatibleWith(Version),
}

impl VersionConstraint {
    pub fn satisfied_by(&self, version: &Version) -> bool {
        match self {
            VersionConstraint::Exact(exact) => version == exact,
            // Pre-releases are only chosen when asked for by name.
            _ if !version.pre.is_empty() => false,
            VersionConstraint::Any => true,
            VersionConstraint::AtLeast(minimum) => version >= minimum,
            VersionConstraint::CompatibleWith(base) => {
                if version < base || version.major != base.major {
                    return false;
                }
                base.major != 0 || version.minor == base.minor
            }
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => write!(f, "any"),
            VersionConstraint::Exact(version) => write!(f, "== {version}"),
            VersionConstraint::AtLeast(version) => write!(f, ">= {version}"),
            VersionConstraint::CompatibleWith(version) => write!(f, "~> {version}"),
        }
    }
}

/// Text that is not one of `any`, `== v`, `>= v`, `~> v` or a bare version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidConstraint(pub String);

impl fmt::Display for InvalidConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid version constraint '{}'", self.0)
    }
}

impl std::error::Error for InvalidConstraint {}

impl FromStr for VersionConstraint {
    type Err = InvalidConstraint;

    /// A bare version is read as `~>`, the usual intent of writing one.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        if text.is_empty() || text == "any" || text == "*" {
            return Ok(VersionConstraint::Any);
        }
        let version = |rest: &str| {
            parse_tag(rest.trim()).ok_or_else(|| InvalidConstraint(text.to_string()))
        };
        if let Some(rest) = text.strip_prefix("==") {
            version(rest).map(VersionConstraint::Exact)
        } else if let Some(rest) = text.strip_prefix(">=") {
            version(rest).map(VersionConstraint::AtLeast)
        } else {
            let rest = text.strip_prefix("~>").unwrap_or(text);
            version(rest).map(VersionConstraint::CompatibleWith)
        }
    }
}

/// A concrete version of a dependency, pinned to the commit its tag points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PinnedVersion {
    pub version: Version,
    pub tag: SmolStr,
    pub revision: String,
}

impl PinnedVersion {
    pub fn new(version: Version, tag: impl Into<SmolStr>, revision: impl Into<String>) -> Self {
        Self {
            version,
            tag: tag.into(),
            revision: revision.into(),
        }
    }
}

impl fmt::Display for PinnedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.tag, self.revision)
    }
}
