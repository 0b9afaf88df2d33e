use std::fmt;

use smol_str::SmolStr;
use url::Url;

use crate::{GitReference, VersionConstraint, git_url};

/// One declared dependency of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: SmolStr,
    pub reference: GitReference,
    pub constraint: VersionConstraint,
    /// Location of a binary definition that may be used instead of building
    /// the dependency from source.
    pub binary: Option<Url>,
}

impl ManifestEntry {
    pub fn new(reference: GitReference, constraint: VersionConstraint) -> Self {
        let name = reference
            .name()
            .or_else(|| git_url::name(&reference.normalized().replace(['/', '\\'], "_")))
            .unwrap_or_else(|| SmolStr::new("_"));
        Self {
            name,
            reference,
            constraint,
            binary: None,
        }
    }

    /// Overrides the derived name. Names become directory names, so they
    /// must be a single path segment.
    pub fn with_name(mut self, name: impl Into<SmolStr>) -> Result<Self, InvalidName> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(InvalidName(name.to_string()));
        }
        self.name = name;
        Ok(self)
    }

    pub fn with_binary(mut self, binary: Url) -> Self {
        self.binary = Some(binary);
        self
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.chars().all(|c| c == '.')
        && !name.contains(['/', '\\', '\0'])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidName(pub String);

impl fmt::Display for InvalidName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid dependency name '{}': it must be a single path segment",
            self.0.escape_debug()
        )
    }
}

impl std::error::Error for InvalidName {}

/// The ordered direct dependencies of a project or of a dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter()
    }
}

impl FromIterator<ManifestEntry> for Manifest {
    fn from_iter<T: IntoIterator<Item = ManifestEntry>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Turns manifest text into entries. The textual grammar belongs to the
/// caller; the resolver only needs something that can read nested
/// manifests out of checked-out dependencies.
pub trait ManifestParser: Send + Sync {
    fn parse(&self, content: &str) -> Result<Manifest, String>;
}

impl<T: ManifestParser + ?Sized> ManifestParser for &T {
    fn parse(&self, content: &str) -> Result<Manifest, String> {
        (**self).parse(content)
    }
}
