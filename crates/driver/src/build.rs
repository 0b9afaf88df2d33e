use std::fmt;

use camino::Utf8Path;
use common::resolved::ResolvedDependency;
use resolver::CancellationToken;
use smol_str::SmolStr;

/// What a successful build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Built,
    /// The dependency had nothing to build; the reason is reported to the
    /// user.
    NothingToBuild(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildError {
    pub dependency: SmolStr,
    pub reason: String,
}

impl BuildError {
    pub fn new(dependency: impl Into<SmolStr>, reason: impl Into<String>) -> Self {
        Self {
            dependency: dependency.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to build {}: {}", self.dependency, self.reason)
    }
}

impl std::error::Error for BuildError {}

/// Builds one checked-out dependency. Called from worker threads, never
/// twice at once for the same dependency.
pub trait Builder: Send + Sync {
    fn build(
        &self,
        dependency: &ResolvedDependency,
        checkout: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<BuildStatus, BuildError>;
}
