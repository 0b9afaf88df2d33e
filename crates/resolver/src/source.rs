use common::{GitReference, Manifest, ManifestParser, PinnedVersion};

use crate::{
    CancellationToken, DependencySource, ManifestReadError, VersionListingError,
    git::GitResolver,
};

/// Reads versions and nested manifests straight out of git mirrors.
pub struct GitDependencySource<'a, P> {
    git: &'a GitResolver,
    parser: P,
    manifest_file: String,
    cancel: CancellationToken,
}

impl<'a, P: ManifestParser> GitDependencySource<'a, P> {
    pub fn new(git: &'a GitResolver, parser: P, manifest_file: impl Into<String>) -> Self {
        Self {
            git,
            parser,
            manifest_file: manifest_file.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl<P: ManifestParser> DependencySource for GitDependencySource<'_, P> {
    fn versions(
        &mut self,
        dependency: &GitReference,
    ) -> Result<Vec<PinnedVersion>, VersionListingError> {
        self.git
            .available_versions(dependency, &self.cancel)
            .map_err(|error| VersionListingError {
                dependency: dependency.clone(),
                reason: error.to_string(),
            })
    }

    fn manifest(
        &mut self,
        dependency: &GitReference,
        pinned: &PinnedVersion,
    ) -> Result<Manifest, ManifestReadError> {
        let read_error = |reason: String| ManifestReadError {
            dependency: dependency.clone(),
            revision: pinned.revision.clone(),
            reason,
        };
        let content = self
            .git
            .read_file(dependency, &pinned.revision, &self.manifest_file, &self.cancel)
            .map_err(|error| read_error(error.to_string()))?;
        match content {
            Some(content) => self.parser.parse(&content).map_err(read_error),
            None => {
                tracing::debug!(
                    target: "resolver",
                    "{} has no {} at {}",
                    dependency,
                    self.manifest_file,
                    pinned.tag
                );
                Ok(Manifest::default())
            }
        }
    }
}
