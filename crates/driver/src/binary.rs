//! Prebuilt binaries: a definition lists one archive per released version.

use std::{collections::BTreeMap, fmt};

use camino::{Utf8Path, Utf8PathBuf};
use common::{Version, resolved::ResolvedDependency, version::parse_tag};
use resolver::CancellationToken;
use url::Url;

/// Released versions of a dependency mapped to their archive locations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryDefinition {
    releases: BTreeMap<Version, Url>,
}

impl BinaryDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a definition from `(version, url)` text pairs. Versions that
    /// do not parse are skipped with a warning.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, Url)>) -> Self {
        let mut definition = Self::new();
        for (version, url) in pairs {
            match parse_tag(version) {
                Some(parsed) => definition.insert(parsed, url),
                None => tracing::warn!(
                    target: "pipeline",
                    "Ignoring binary release with invalid version '{version}'"
                ),
            }
        }
        definition
    }

    pub fn insert(&mut self, version: Version, url: Url) {
        self.releases.insert(version, url);
    }

    pub fn release_for(&self, version: &Version) -> Option<BinaryRelease> {
        self.releases.get(version).map(|url| BinaryRelease {
            version: version.clone(),
            url: url.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRelease {
    pub version: Version,
    pub url: Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFetchError {
    pub url: Url,
    pub reason: String,
}

impl BinaryFetchError {
    pub fn new(url: &Url, reason: impl Into<String>) -> Self {
        Self {
            url: url.clone(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for BinaryFetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.url, self.reason)
    }
}

impl std::error::Error for BinaryFetchError {}

/// Downloads and installs prebuilt binaries. Every failure is recoverable:
/// the pipeline falls back to building from source.
pub trait BinaryFetcher: Send + Sync {
    fn definition(&self, url: &Url) -> Result<BinaryDefinition, BinaryFetchError>;

    /// Downloads the archive of `release` and returns where it was stored.
    fn download(
        &self,
        dependency: &ResolvedDependency,
        release: &BinaryRelease,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, BinaryFetchError>;

    fn install(
        &self,
        dependency: &ResolvedDependency,
        release: &BinaryRelease,
        archive: &Utf8Path,
    ) -> Result<(), BinaryFetchError>;
}

/// Never has a binary; every dependency is built from source.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBinaries;

impl BinaryFetcher for NoBinaries {
    fn definition(&self, url: &Url) -> Result<BinaryDefinition, BinaryFetchError> {
        Err(BinaryFetchError::new(url, "binary downloads are disabled"))
    }

    fn download(
        &self,
        _dependency: &ResolvedDependency,
        release: &BinaryRelease,
        _cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, BinaryFetchError> {
        Err(BinaryFetchError::new(
            &release.url,
            "binary downloads are disabled",
        ))
    }

    fn install(
        &self,
        _dependency: &ResolvedDependency,
        release: &BinaryRelease,
        _archive: &Utf8Path,
    ) -> Result<(), BinaryFetchError> {
        Err(BinaryFetchError::new(
            &release.url,
            "binary downloads are disabled",
        ))
    }
}
