pub mod cancel;
pub mod checkout;
pub mod git;
pub mod search;
pub mod source;

use std::fmt;

use common::{
    GitReference, Manifest, PinnedVersion, VersionConstraint,
    dependencies::{Dependency, Requester},
};
use smol_str::SmolStr;

pub use cancel::CancellationToken;
pub use search::Resolver;

/// Where the resolver learns which versions exist and what each version
/// depends on.
///
/// Implementations may perform blocking network or filesystem I/O.
pub trait DependencySource {
    /// Every version available for `dependency`, in any order.
    fn versions(
        &mut self,
        dependency: &GitReference,
    ) -> Result<Vec<PinnedVersion>, VersionListingError>;

    /// The manifest of `dependency` at the pinned version. A dependency
    /// without a manifest has no dependencies of its own.
    fn manifest(
        &mut self,
        dependency: &GitReference,
        pinned: &PinnedVersion,
    ) -> Result<Manifest, ManifestReadError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestReadError {
    pub dependency: GitReference,
    pub revision: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionListingError {
    pub dependency: GitReference,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// No available version satisfies every constraint on `identity`.
    Conflict {
        identity: GitReference,
        name: SmolStr,
        constraints: Vec<(Requester, VersionConstraint)>,
    },
    /// Listed from the requester around to itself.
    CycleDetected { path: Vec<GitReference> },
    /// Two different remotes would share one checkout directory.
    DuplicateName {
        name: SmolStr,
        first: GitReference,
        second: GitReference,
    },
    ManifestRead(ManifestReadError),
    VersionListing(VersionListingError),
    Cancelled,
}

impl ResolutionError {
    pub(crate) fn conflict(dependency: &Dependency) -> Self {
        ResolutionError::Conflict {
            identity: dependency.identity.clone(),
            name: dependency.name.clone(),
            constraints: dependency.constraints.clone(),
        }
    }
}

impl From<ManifestReadError> for ResolutionError {
    fn from(error: ManifestReadError) -> Self {
        ResolutionError::ManifestRead(error)
    }
}

impl From<VersionListingError> for ResolutionError {
    fn from(error: VersionListingError) -> Self {
        ResolutionError::VersionListing(error)
    }
}

impl fmt::Display for ManifestReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to read the manifest of {} at {}: {}",
            self.dependency, self.revision, self.reason
        )
    }
}

impl fmt::Display for VersionListingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to list versions of {}: {}",
            self.dependency, self.reason
        )
    }
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionError::Conflict {
                identity,
                name,
                constraints,
            } => {
                write!(
                    f,
                    "No version of {name} ({}) satisfies all constraints:",
                    identity.normalized()
                )?;
                for (requester, constraint) in constraints {
                    write!(f, "\n    {constraint} (from {requester})")?;
                }
                Ok(())
            }
            ResolutionError::CycleDetected { path } => {
                let names: Vec<String> = path
                    .iter()
                    .map(|reference| {
                        reference
                            .name()
                            .map(|name| name.to_string())
                            .unwrap_or_else(|| reference.to_string())
                    })
                    .collect();
                write!(f, "Dependency cycle detected: {}", names.join(" -> "))
            }
            ResolutionError::DuplicateName {
                name,
                first,
                second,
            } => write!(
                f,
                "{} and {} are both named {name}; give one of them a different name",
                first.normalized(),
                second.normalized()
            ),
            ResolutionError::ManifestRead(error) => error.fmt(f),
            ResolutionError::VersionListing(error) => error.fmt(f),
            ResolutionError::Cancelled => write!(f, "Resolution was cancelled"),
        }
    }
}

impl std::error::Error for ManifestReadError {}

impl std::error::Error for VersionListingError {}

impl std::error::Error for ResolutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolutionError::ManifestRead(error) => Some(error),
            ResolutionError::VersionListing(error) => Some(error),
            _ => None,
        }
    }
}
