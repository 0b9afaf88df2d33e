mod graph;

use std::fmt;

use smol_str::SmolStr;
use url::Url;

use crate::{GitReference, VersionConstraint};

pub use graph::{Checkpoint, CyclePath, DependencyGraph};

/// Who asked for a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Requester {
    Root,
    Dependency(GitReference),
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requester::Root => write!(f, "root manifest"),
            Requester::Dependency(reference) => write!(f, "{reference}"),
        }
    }
}

/// A dependency together with every constraint placed on it.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub identity: GitReference,
    pub name: SmolStr,
    pub constraints: Vec<(Requester, VersionConstraint)>,
    /// Every raw spelling the identity was referenced by, first one first.
    pub spellings: Vec<String>,
    pub binary: Option<Url>,
}

impl Dependency {
    pub fn satisfied_by(&self, version: &crate::Version) -> bool {
        self.constraints
            .iter()
            .all(|(_, constraint)| constraint.satisfied_by(version))
    }

    pub fn has_conflicting_spellings(&self) -> bool {
        self.spellings.len() > 1
    }
}

/// Two or more raw spellings that normalize to the same identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpellingConflict {
    pub identity: String,
    pub spellings: Vec<String>,
}

impl fmt::Display for SpellingConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is referenced by different spellings: {}",
            self.identity,
            self.spellings.join(", ")
        )
    }
}
