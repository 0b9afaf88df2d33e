//! Orchestration of the `resolve`, `checkout` and `build` commands.
//!
//! [`Project`] ties together the project's settings and manifest, the
//! resolver, and the concurrent checkout/build [`Pipeline`]. Progress is
//! reported through an [`EventSink`]; per-dependency results come back as
//! a [`PipelineReport`].

pub mod binary;
pub mod build;
pub mod build_cache;
pub mod events;
pub mod pipeline;
pub mod scheduler;

use std::{fs, io};

use camino::Utf8PathBuf;
use common::{
    Manifest, ManifestParser,
    resolved::{ResolvedGraph, ResolvedManifest, ResolvedManifestError},
    settings::Settings,
};
use resolver::{
    CancellationToken, ResolutionError, Resolver, git::GitResolver, source::GitDependencySource,
};
use smol_str::SmolStr;
use thiserror::Error;

pub use binary::{BinaryDefinition, BinaryFetchError, BinaryFetcher, BinaryRelease, NoBinaries};
pub use build::{BuildError, BuildStatus, Builder};
pub use build_cache::{BuildCache, CacheError};
pub use events::{EventSink, ProjectEvent, ProjectEventKind, event_channel};
pub use pipeline::{
    Completion, NodeFailure, NodeOutcome, Pipeline, PipelineMode, PipelineReport,
};
pub use scheduler::{ScheduleError, schedule};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to read manifest {path}: {error}")]
    ManifestRead { path: Utf8PathBuf, error: io::Error },
    #[error("failed to parse manifest {path}: {reason}")]
    ManifestParse { path: Utf8PathBuf, reason: String },
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    ResolvedManifest(#[from] ResolvedManifestError),
    #[error("unknown dependencies: {}", .0.join(", "))]
    UnknownDependencies(Vec<SmolStr>),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// A project directory with its settings and a reader for its manifests.
pub struct Project<'a> {
    settings: &'a Settings,
    parser: &'a dyn ManifestParser,
    cancel: CancellationToken,
}

impl<'a> Project<'a> {
    pub fn new(settings: &'a Settings, parser: &'a dyn ManifestParser) -> Self {
        Self {
            settings,
            parser,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &Settings {
        self.settings
    }

    pub fn git(&self) -> GitResolver {
        GitResolver::new(
            self.settings.checkouts_dir.clone(),
            self.settings.repositories_dir(),
        )
        .with_fetch_retries(self.settings.fetch_retries)
        .with_ssh(self.settings.use_ssh)
    }

    /// The project's own manifest. A project without one has no
    /// dependencies.
    pub fn manifest(&self) -> Result<Manifest, CommandError> {
        let path = self.settings.manifest_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(target: "pipeline", "No manifest at {path}");
                return Ok(Manifest::default());
            }
            Err(error) => return Err(CommandError::ManifestRead { path, error }),
        };
        self.parser
            .parse(&content)
            .map_err(|reason| CommandError::ManifestParse { path, reason })
    }

    /// The previously persisted resolution, if any.
    pub fn pinned(&self) -> Result<Option<ResolvedGraph>, CommandError> {
        match ResolvedManifest::load(&self.settings.resolved_path())? {
            Some(manifest) => Ok(Some(manifest.to_graph()?)),
            None => Ok(None),
        }
    }

    pub fn save_resolved(&self, graph: &ResolvedGraph) -> Result<(), CommandError> {
        ResolvedManifest::from_graph(graph).save(&self.settings.resolved_path())?;
        Ok(())
    }

    /// Resolves the manifest. Unless `update` is set, a persisted resolution
    /// that still satisfies every constraint is reused as is.
    pub fn resolve(&self, git: &GitResolver, update: bool) -> Result<ResolvedGraph, CommandError> {
        let manifest = self.manifest()?;
        let pinned = if update { None } else { self.pinned()? };
        let source = GitDependencySource::new(git, self.parser, self.settings.manifest_file.clone())
            .with_cancellation(self.cancel.clone());
        let mut resolver = Resolver::new(source).with_cancellation(self.cancel.clone());
        let resolved = match &pinned {
            Some(pinned) => resolver.resolve_with_pinned(&manifest, pinned)?,
            None => resolver.resolve(&manifest)?,
        };
        Ok(resolved)
    }

    /// Resolves if needed and rewrites the resolved file when the result
    /// differs from what was pinned.
    pub fn ensure_resolved(&self, git: &GitResolver) -> Result<ResolvedGraph, CommandError> {
        let pinned = self.pinned()?;
        let resolved = self.resolve(git, false)?;
        let unchanged = pinned.as_ref().is_some_and(|pinned| {
            ResolvedManifest::from_graph(pinned) == ResolvedManifest::from_graph(&resolved)
        });
        if !unchanged {
            tracing::info!(
                target: "pipeline",
                "Writing {}",
                self.settings.resolved_path()
            );
            self.save_resolved(&resolved)?;
        }
        Ok(resolved)
    }

    /// Brings every selected dependency's working tree to its pinned
    /// revision. An empty `only` selects everything.
    pub fn checkout(
        &self,
        only: &[SmolStr],
        events: &dyn EventSink,
    ) -> Result<PipelineReport, CommandError> {
        self.run(only, events, PipelineMode::Checkout)
    }

    /// Checks out and builds the selected dependencies, skipping those with
    /// a valid cached build.
    pub fn build(
        &self,
        only: &[SmolStr],
        events: &dyn EventSink,
        builder: &dyn Builder,
        binaries: &dyn BinaryFetcher,
    ) -> Result<PipelineReport, CommandError> {
        let binaries = self.settings.use_binaries.then_some(binaries);
        self.run(only, events, PipelineMode::Build { builder, binaries })
    }

    fn run(
        &self,
        only: &[SmolStr],
        events: &dyn EventSink,
        mode: PipelineMode<'_>,
    ) -> Result<PipelineReport, CommandError> {
        let git = self.git();
        let resolved = self.ensure_resolved(&git)?;
        let selected = if only.is_empty() {
            resolved
        } else {
            resolved
                .closure_of(only)
                .map_err(CommandError::UnknownDependencies)?
        };

        let building = matches!(mode, PipelineMode::Build { .. });
        let cache_path = self.settings.build_cache_path();
        let cache = if building {
            BuildCache::load_or_default(&cache_path)
        } else {
            BuildCache::new()
        };

        let pipeline = Pipeline::new(&git, events, mode)
            .with_cache(cache)
            .with_cancellation(self.cancel.clone());
        let report = schedule(&pipeline, &selected, self.settings.max_concurrency)?;
        if building {
            pipeline.into_cache().save(&cache_path)?;
        }
        Ok(report)
    }
}
