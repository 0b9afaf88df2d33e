//! The per-dependency checkout and build state machine.
//!
//! ```text
//! Pending ─┬─> Cloning ──┬─> CheckedOut ─┬─> Done                 (checkout only)
//!          └─> Fetching ─┘               ├─> BuildSkippedCached ─> Done
//!                                        ├─> Rebuilding ─────────> Done
//!                                        └─> Building ───────────> Done
//! Pending ─> DownloadingBinaryDefinition ─> DownloadingBinary ─> Done
//!            (any binary failure falls back to Cloning or Fetching)
//! ```
//!
//! Every non-terminal state may also move to `Failed`.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use camino::{Utf8Path, Utf8PathBuf};
use common::{GitReference, resolved::ResolvedDependency};
use indexmap::IndexMap;
use resolver::{CancellationToken, checkout::CheckoutBackend, git::GitOperationError};
use smol_str::SmolStr;
use url::Url;

use crate::{
    binary::BinaryFetcher,
    build::{BuildError, BuildStatus, Builder},
    build_cache::{BuildCache, CacheStatus, Fingerprint},
    events::{EventSink, ProjectEvent, ProjectEventKind},
};

#[derive(Clone, Copy)]
pub enum PipelineMode<'a> {
    /// Stop once the working tree is at the pinned revision.
    Checkout,
    /// Continue through the build cache and builder. Without a fetcher,
    /// binary definitions are ignored.
    Build {
        builder: &'a dyn Builder,
        binaries: Option<&'a dyn BinaryFetcher>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Pending,
    Cloning,
    Fetching,
    DownloadingBinaryDefinition,
    DownloadingBinary,
    CheckedOut,
    BuildSkippedCached,
    Rebuilding,
    Building,
    Done,
    Failed,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Done | NodeState::Failed)
    }

    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Pending, Cloning | Fetching | DownloadingBinaryDefinition | BuildSkippedCached)
                | (DownloadingBinaryDefinition, DownloadingBinary | Cloning | Fetching)
                | (DownloadingBinary, Done | Cloning | Fetching)
                | (Cloning | Fetching, CheckedOut)
                | (CheckedOut, Done | BuildSkippedCached | Rebuilding | Building)
                | (BuildSkippedCached | Rebuilding | Building, Done)
        )
    }
}

/// How a dependency reached `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    CheckedOut,
    SkippedCached,
    Built,
    Rebuilt,
    NothingToBuild,
    InstalledBinary,
}

#[derive(Debug)]
pub enum NodeFailure {
    Git(GitOperationError),
    Build(BuildError),
    /// A dependency this node requires did not reach `Done`.
    DependencyFailed { dependency: SmolStr },
    Cancelled,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeFailure::Git(error) => error.fmt(f),
            NodeFailure::Build(error) => error.fmt(f),
            NodeFailure::DependencyFailed { dependency } => {
                write!(f, "Dependency {dependency} failed")
            }
            NodeFailure::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::error::Error for NodeFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeFailure::Git(error) => Some(error),
            NodeFailure::Build(error) => Some(error),
            _ => None,
        }
    }
}

impl From<GitOperationError> for NodeFailure {
    fn from(error: GitOperationError) -> Self {
        match error {
            GitOperationError::Cancelled => NodeFailure::Cancelled,
            error => NodeFailure::Git(error),
        }
    }
}

#[derive(Debug)]
pub enum NodeOutcome {
    Done(Completion),
    Failed(NodeFailure),
}

impl NodeOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, NodeOutcome::Done(_))
    }

    pub fn failure(&self) -> Option<&NodeFailure> {
        match self {
            NodeOutcome::Failed(failure) => Some(failure),
            NodeOutcome::Done(_) => None,
        }
    }
}

/// Per-dependency results of one pipeline run, in dependency order.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub outcomes: IndexMap<SmolStr, NodeOutcome>,
}

impl PipelineReport {
    /// True only when every dependency reached `Done`.
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(NodeOutcome::is_done)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&SmolStr, &NodeFailure)> {
        self.outcomes
            .iter()
            .filter_map(|(name, outcome)| outcome.failure().map(|failure| (name, failure)))
    }

    pub fn successes(&self) -> impl Iterator<Item = (&SmolStr, Completion)> {
        self.outcomes.iter().filter_map(|(name, outcome)| match outcome {
            NodeOutcome::Done(completion) => Some((name, *completion)),
            NodeOutcome::Failed(_) => None,
        })
    }

    pub fn get(&self, name: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(name)
    }
}

/// Shared, thread-safe context for driving dependencies through their
/// state machines.
pub struct Pipeline<'a> {
    checkouts: &'a dyn CheckoutBackend,
    events: &'a dyn EventSink,
    mode: PipelineMode<'a>,
    cache: Mutex<BuildCache>,
    cancel: CancellationToken,
    locks: Mutex<HashMap<GitReference, Arc<Mutex<()>>>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        checkouts: &'a dyn CheckoutBackend,
        events: &'a dyn EventSink,
        mode: PipelineMode<'a>,
    ) -> Self {
        Self {
            checkouts,
            events,
            mode,
            cache: Mutex::new(BuildCache::new()),
            cancel: CancellationToken::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cache(mut self, cache: BuildCache) -> Self {
        self.cache = Mutex::new(cache);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn into_cache(self) -> BuildCache {
        self.cache.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drives one dependency to a terminal state. Concurrent calls for the
    /// same dependency are serialized.
    ///
    /// Everything `dependency` requires must already have finished, so the
    /// cache holds the upstream builds it is built against.
    pub fn run(&self, dependency: &ResolvedDependency) -> NodeOutcome {
        let lock = self.lock_for(&dependency.reference);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let outcome = NodeRun::new(self, dependency).drive();
        match &outcome {
            NodeOutcome::Done(completion) => tracing::info!(
                target: "pipeline",
                "{} finished: {:?}",
                dependency.name,
                completion
            ),
            NodeOutcome::Failed(failure) => tracing::warn!(
                target: "pipeline",
                "{} failed: {}",
                dependency.name,
                failure
            ),
        }
        outcome
    }

    fn lock_for(&self, identity: &GitReference) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(identity.clone()).or_default().clone()
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, BuildCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Covers the revision of `dependency` and the recorded build of each
    /// dependency it requires. An upstream without a build counts as empty.
    fn fingerprint(&self, dependency: &ResolvedDependency) -> Fingerprint {
        let cache = self.cache();
        Fingerprint::new(
            dependency.revision(),
            dependency
                .dependencies
                .iter()
                .map(|required| cache.build_stamp(required).unwrap_or_default()),
        )
    }
}

struct NodeRun<'p, 'a> {
    pipeline: &'p Pipeline<'a>,
    dependency: &'p ResolvedDependency,
    state: NodeState,
}

impl<'p, 'a> NodeRun<'p, 'a> {
    fn new(pipeline: &'p Pipeline<'a>, dependency: &'p ResolvedDependency) -> Self {
        Self {
            pipeline,
            dependency,
            state: NodeState::Pending,
        }
    }

    fn drive(&mut self) -> NodeOutcome {
        let (pipeline, dependency) = (self.pipeline, self.dependency);
        if pipeline.cancel.is_cancelled() {
            return self.fail(NodeFailure::Cancelled);
        }
        let fingerprint = pipeline.fingerprint(dependency);

        if let PipelineMode::Build {
            binaries: Some(binaries),
            ..
        } = pipeline.mode
            && let Some(url) = &dependency.binary
            && let Some(outcome) = self.try_binary(binaries, url, &fingerprint)
        {
            return outcome;
        }

        let checkout = match self.checkout() {
            Ok(path) => path,
            Err(failure) => return self.fail(failure),
        };
        match pipeline.mode {
            PipelineMode::Checkout => self.done(Completion::CheckedOut),
            PipelineMode::Build { builder, .. } => {
                self.build(builder, &checkout, fingerprint)
            }
        }
    }

    fn checkout(&mut self) -> Result<Utf8PathBuf, NodeFailure> {
        let (pipeline, dependency) = (self.pipeline, self.dependency);
        let checkouts = pipeline.checkouts;
        if checkouts.has_checkout(dependency) {
            self.transition(NodeState::Fetching, Some(ProjectEventKind::Fetching));
            checkouts.fetch_dependency(dependency, &pipeline.cancel)?;
        } else {
            self.transition(NodeState::Cloning, Some(ProjectEventKind::Cloning));
            checkouts.clone_dependency(dependency, &pipeline.cancel)?;
        }

        self.transition(
            NodeState::CheckedOut,
            Some(ProjectEventKind::CheckingOut {
                revision: dependency.pinned.tag.to_string(),
            }),
        );
        Ok(checkouts.checkout_dependency(dependency, &pipeline.cancel)?)
    }

    fn build(
        &mut self,
        builder: &dyn Builder,
        checkout: &Utf8Path,
        fingerprint: Fingerprint,
    ) -> NodeOutcome {
        let (pipeline, dependency) = (self.pipeline, self.dependency);
        let status = pipeline.cache().status(&dependency.reference, &fingerprint);
        let rebuilding = match status {
            CacheStatus::Valid => {
                self.transition(
                    NodeState::BuildSkippedCached,
                    Some(ProjectEventKind::SkippedBuildingCached),
                );
                return self.done(Completion::SkippedCached);
            }
            CacheStatus::Invalid => {
                self.transition(
                    NodeState::Rebuilding,
                    Some(ProjectEventKind::RebuildingCached),
                );
                true
            }
            CacheStatus::Missing => {
                self.transition(
                    NodeState::Building,
                    Some(ProjectEventKind::BuildingUncached),
                );
                false
            }
        };

        if pipeline.cancel.is_cancelled() {
            return self.fail(NodeFailure::Cancelled);
        }
        match builder.build(dependency, checkout, &pipeline.cancel) {
            Ok(status) => {
                self.record(fingerprint);
                match status {
                    BuildStatus::Built if rebuilding => self.done(Completion::Rebuilt),
                    BuildStatus::Built => self.done(Completion::Built),
                    BuildStatus::NothingToBuild(reason) => {
                        self.emit(ProjectEventKind::SkippedBuilding { reason });
                        self.done(Completion::NothingToBuild)
                    }
                }
            }
            Err(error) => {
                pipeline.cache().invalidate(&dependency.reference);
                if pipeline.cancel.is_cancelled() {
                    self.fail(NodeFailure::Cancelled)
                } else {
                    self.fail(NodeFailure::Build(error))
                }
            }
        }
    }

    /// Installs a prebuilt binary. `None` means fall back to the source
    /// path; the reason has already been reported.
    fn try_binary(
        &mut self,
        binaries: &dyn BinaryFetcher,
        url: &Url,
        fingerprint: &Fingerprint,
    ) -> Option<NodeOutcome> {
        let (pipeline, dependency) = (self.pipeline, self.dependency);
        let status = pipeline.cache().status(&dependency.reference, fingerprint);
        if status == CacheStatus::Valid {
            self.transition(
                NodeState::BuildSkippedCached,
                Some(ProjectEventKind::SkippedBuildingCached),
            );
            return Some(self.done(Completion::SkippedCached));
        }

        self.transition(
            NodeState::DownloadingBinaryDefinition,
            Some(ProjectEventKind::DownloadingBinaryDefinition { url: url.clone() }),
        );
        let definition = match binaries.definition(url) {
            Ok(definition) => definition,
            Err(error) => return self.skip_binary(error.to_string()),
        };
        let Some(release) = definition.release_for(dependency.version()) else {
            return self.skip_binary(format!(
                "no binary release for version {}",
                dependency.version()
            ));
        };

        self.transition(
            NodeState::DownloadingBinary,
            Some(ProjectEventKind::DownloadingBinary {
                release: release.version.to_string(),
            }),
        );
        let archive = match binaries.download(dependency, &release, &pipeline.cancel) {
            Ok(archive) => archive,
            Err(_) if pipeline.cancel.is_cancelled() => {
                return Some(self.fail(NodeFailure::Cancelled));
            }
            Err(error) => return self.skip_binary(error.to_string()),
        };
        if let Err(error) = binaries.install(dependency, &release, &archive) {
            self.emit(ProjectEventKind::SkippedInstallingBinary {
                error: error.to_string(),
            });
            return None;
        }

        self.record(fingerprint.clone());
        Some(self.done(Completion::InstalledBinary))
    }

    fn skip_binary(&mut self, reason: String) -> Option<NodeOutcome> {
        self.emit(ProjectEventKind::SkippedDownloadingBinary { reason });
        None
    }

    fn record(&self, fingerprint: Fingerprint) {
        self.pipeline.cache().record(
            &self.dependency.reference,
            self.dependency.version().to_string(),
            self.dependency.revision(),
            fingerprint,
        );
    }

    fn transition(&mut self, next: NodeState, event: Option<ProjectEventKind>) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(
            target: "pipeline",
            "{}: {:?} -> {:?}",
            self.dependency.name,
            self.state,
            next
        );
        if let Some(kind) = event {
            self.emit(kind);
        }
        self.state = next;
    }

    fn emit(&self, kind: ProjectEventKind) {
        self.pipeline
            .events
            .put(ProjectEvent::new(self.dependency.name.clone(), kind));
    }

    fn done(&mut self, completion: Completion) -> NodeOutcome {
        self.transition(NodeState::Done, None);
        NodeOutcome::Done(completion)
    }

    fn fail(&mut self, failure: NodeFailure) -> NodeOutcome {
        self.transition(NodeState::Failed, None);
        NodeOutcome::Failed(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_state_machine() {
        use NodeState::*;
        assert!(Pending.can_transition_to(Cloning));
        assert!(Fetching.can_transition_to(CheckedOut));
        assert!(CheckedOut.can_transition_to(Rebuilding));
        assert!(DownloadingBinary.can_transition_to(Fetching));
        assert!(Building.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(CheckedOut));
        assert!(!Cloning.can_transition_to(Building));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
    }
}
