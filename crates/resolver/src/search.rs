use std::collections::HashMap;

use common::{
    GitReference, Manifest, PinnedVersion,
    dependencies::{DependencyGraph, Requester},
    resolved::{ResolvedDependency, ResolvedGraph},
};
use indexmap::IndexMap;

use crate::{CancellationToken, DependencySource, ResolutionError};

/// Backtracking search for one version per dependency identity.
///
/// Candidates are tried newest first. Dependencies are picked in the order
/// they are discovered, so the same manifests and candidate lists always
/// produce the same result.
pub struct Resolver<S> {
    source: S,
    cancel: CancellationToken,
    candidates: HashMap<GitReference, Vec<PinnedVersion>>,
    manifests: HashMap<(GitReference, String), Manifest>,
}

#[derive(Default)]
struct SearchState {
    graph: DependencyGraph,
    chosen: IndexMap<GitReference, PinnedVersion>,
}

impl<S: DependencySource> Resolver<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cancel: CancellationToken::new(),
            candidates: HashMap::new(),
            manifests: HashMap::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn resolve(&mut self, root: &Manifest) -> Result<ResolvedGraph, ResolutionError> {
        tracing::info!(target: "resolver", "Resolving {} root dependencies", root.entries.len());
        let mut state = Self::seed(root);
        self.search(&mut state)?;
        let resolved = Self::finish(&state)?;
        tracing::info!(target: "resolver", "Resolved {} dependencies", resolved.len());
        Ok(resolved)
    }

    /// Reuses `pinned` when it still satisfies `root` and every pinned
    /// dependency's own manifest; otherwise runs a full search.
    pub fn resolve_with_pinned(
        &mut self,
        root: &Manifest,
        pinned: &ResolvedGraph,
    ) -> Result<ResolvedGraph, ResolutionError> {
        if let Some(resolved) = self.verify_pinned(root, pinned)? {
            tracing::info!(target: "resolver", "Pinned resolution is still valid");
            return Ok(resolved);
        }
        tracing::info!(target: "resolver", "Pinned resolution is stale, searching");
        self.resolve(root)
    }

    fn seed(root: &Manifest) -> SearchState {
        let mut state = SearchState::default();
        for entry in root.iter() {
            // Root requirements carry no edge and cannot form a cycle.
            let _ = state.graph.add_requirement(&Requester::Root, entry);
        }
        state
    }

    fn search(&mut self, state: &mut SearchState) -> Result<(), ResolutionError> {
        if self.cancel.is_cancelled() {
            return Err(ResolutionError::Cancelled);
        }
        let Some(next) = state
            .graph
            .iter()
            .find(|dependency| !state.chosen.contains_key(&dependency.identity))
            .map(|dependency| dependency.identity.clone())
        else {
            return Ok(());
        };

        let Some(dependency) = state.graph.get(&next) else {
            return Ok(());
        };
        let viable: Vec<PinnedVersion> = self
            .candidates_for(&next)?
            .iter()
            .filter(|candidate| dependency.satisfied_by(&candidate.version))
            .cloned()
            .collect();
        if viable.is_empty() {
            tracing::debug!(target: "resolver", "No candidate for {}", dependency.name);
            return Err(ResolutionError::conflict(dependency));
        }

        let mut last_conflict = ResolutionError::conflict(dependency);
        for candidate in viable {
            tracing::debug!(target: "resolver", "Trying {} {}", next, candidate.version);
            let checkpoint = state.graph.checkpoint();
            state.chosen.insert(next.clone(), candidate.clone());

            let outcome = self
                .expand(state, &next, &candidate)
                .and_then(|()| self.search(state));
            match outcome {
                Ok(()) => return Ok(()),
                Err(conflict @ ResolutionError::Conflict { .. }) => {
                    tracing::debug!(
                        target: "resolver",
                        "Backtracking from {} {}",
                        next,
                        candidate.version
                    );
                    last_conflict = conflict;
                }
                Err(error) => return Err(error),
            }

            state.chosen.shift_remove(&next);
            state.graph.rollback(checkpoint);
        }

        Err(last_conflict)
    }

    /// Adds the chosen version's own requirements to the graph. Fails with a
    /// conflict when a new constraint rules out a version chosen earlier.
    fn expand(
        &mut self,
        state: &mut SearchState,
        identity: &GitReference,
        pinned: &PinnedVersion,
    ) -> Result<(), ResolutionError> {
        let manifest = self.manifest_for(identity, pinned)?;
        let requester = Requester::Dependency(identity.clone());
        for entry in manifest.iter() {
            state
                .graph
                .add_requirement(&requester, entry)
                .map_err(|path| ResolutionError::CycleDetected { path })?;
            if let Some(chosen) = state.chosen.get(&entry.reference)
                && !entry.constraint.satisfied_by(&chosen.version)
                && let Some(dependency) = state.graph.get(&entry.reference)
            {
                return Err(ResolutionError::conflict(dependency));
            }
        }
        Ok(())
    }

    fn verify_pinned(
        &mut self,
        root: &Manifest,
        pinned: &ResolvedGraph,
    ) -> Result<Option<ResolvedGraph>, ResolutionError> {
        let mut state = Self::seed(root);
        loop {
            let Some(dependency) = state
                .graph
                .iter()
                .find(|dependency| !state.chosen.contains_key(&dependency.identity))
            else {
                return Self::finish(&state).map(Some);
            };
            let Some(resolved) = pinned.get(&dependency.identity) else {
                return Ok(None);
            };
            if !dependency.satisfied_by(resolved.version()) {
                return Ok(None);
            }
            let identity = dependency.identity.clone();
            let version = resolved.pinned.clone();
            state.chosen.insert(identity.clone(), version.clone());
            match self.expand(&mut state, &identity, &version) {
                Ok(()) => {}
                Err(ResolutionError::Conflict { .. }) => return Ok(None),
                // A pin whose revision disappeared (a moved tag) is only
                // stale, a fresh search may still succeed.
                Err(ResolutionError::ManifestRead(error)) => {
                    tracing::warn!(target: "resolver", "{error}; discarding pinned resolution");
                    return Ok(None);
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn finish(state: &SearchState) -> Result<ResolvedGraph, ResolutionError> {
        let conflicts = state.graph.spelling_conflicts();
        for conflict in &conflicts {
            tracing::warn!(target: "resolver", "{conflict}");
        }
        let mut resolved = ResolvedGraph::new().with_spelling_conflicts(conflicts);
        for dependency in state.graph.iter() {
            let Some(pinned) = state.chosen.get(&dependency.identity) else {
                continue;
            };
            resolved.insert(ResolvedDependency {
                name: dependency.name.clone(),
                reference: dependency.identity.clone(),
                pinned: pinned.clone(),
                dependencies: state.graph.requirements_of(&dependency.identity),
                binary: dependency.binary.clone(),
            });
        }
        if let Some((first, second)) = resolved.duplicate_name() {
            return Err(ResolutionError::DuplicateName {
                name: first.name.clone(),
                first: first.reference.clone(),
                second: second.reference.clone(),
            });
        }
        Ok(resolved)
    }

    fn candidates_for(
        &mut self,
        identity: &GitReference,
    ) -> Result<&[PinnedVersion], ResolutionError> {
        if !self.candidates.contains_key(identity) {
            let mut versions = self.source.versions(identity)?;
            versions.sort_by(|a, b| b.version.cmp(&a.version).then_with(|| a.tag.cmp(&b.tag)));
            versions.dedup_by(|a, b| a.version == b.version);
            self.candidates.insert(identity.clone(), versions);
        }
        Ok(self
            .candidates
            .get(identity)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    fn manifest_for(
        &mut self,
        identity: &GitReference,
        pinned: &PinnedVersion,
    ) -> Result<Manifest, ResolutionError> {
        let key = (identity.clone(), pinned.revision.clone());
        if let Some(manifest) = self.manifests.get(&key) {
            return Ok(manifest.clone());
        }
        let manifest = self.source.manifest(identity, pinned)?;
        self.manifests.insert(key, manifest.clone());
        Ok(manifest)
    }
}
