use camino::Utf8PathBuf;
use common::resolved::ResolvedDependency;

use crate::{
    CancellationToken,
    git::{GitOperationError, GitResolver},
};

/// The git side of the checkout pipeline, one call per pipeline stage.
///
/// Implementations must tolerate concurrent calls for different
/// dependencies; the pipeline never runs two stages of the same dependency
/// at once.
pub trait CheckoutBackend: Send + Sync {
    fn has_checkout(&self, dependency: &ResolvedDependency) -> bool;

    fn clone_dependency(
        &self,
        dependency: &ResolvedDependency,
        cancel: &CancellationToken,
    ) -> Result<(), GitOperationError>;

    /// Brings an existing checkout up to date. Returns `false` when nothing
    /// had to be transferred.
    fn fetch_dependency(
        &self,
        dependency: &ResolvedDependency,
        cancel: &CancellationToken,
    ) -> Result<bool, GitOperationError>;

    /// Puts the working tree at the pinned revision and returns its path.
    fn checkout_dependency(
        &self,
        dependency: &ResolvedDependency,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, GitOperationError>;
}

impl CheckoutBackend for GitResolver {
    fn has_checkout(&self, dependency: &ResolvedDependency) -> bool {
        GitResolver::has_checkout(self, &dependency.name)
    }

    fn clone_dependency(
        &self,
        dependency: &ResolvedDependency,
        cancel: &CancellationToken,
    ) -> Result<(), GitOperationError> {
        // Seed the mirror so that the clone itself stays local.
        self.ensure_mirror(&dependency.reference, cancel)?;
        self.clone_checkout(&dependency.name, &dependency.reference, cancel)?;
        Ok(())
    }

    fn fetch_dependency(
        &self,
        dependency: &ResolvedDependency,
        cancel: &CancellationToken,
    ) -> Result<bool, GitOperationError> {
        self.fetch_checkout(
            &dependency.name,
            &dependency.reference,
            dependency.revision(),
            cancel,
        )
    }

    fn checkout_dependency(
        &self,
        dependency: &ResolvedDependency,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, GitOperationError> {
        if cancel.is_cancelled() {
            return Err(GitOperationError::Cancelled);
        }
        self.checkout_revision(&dependency.name, dependency.revision())
    }
}
