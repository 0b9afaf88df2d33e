use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use camino::{Utf8Path, Utf8PathBuf};
use common::{
    GitReference, PinnedVersion, Version,
    resolved::{ResolvedDependency, ResolvedGraph},
};
use resolver::{CancellationToken, checkout::CheckoutBackend, git::GitOperationError};
use strand_driver::{
    BinaryDefinition, BinaryFetcher, BinaryRelease, BuildCache, BuildError, BuildStatus, Builder,
    Completion, EventSink, NodeFailure, NodeOutcome, Pipeline, PipelineMode, PipelineReport,
    ProjectEvent, ProjectEventKind, ScheduleError, binary::BinaryFetchError, schedule,
};
use smol_str::SmolStr;
use url::Url;

fn reference(name: &str) -> GitReference {
    GitReference::new(format!("https://example.com/acme/{name}.git"))
}

fn dependency(name: &str, revision: &str, requires: &[&str]) -> ResolvedDependency {
    ResolvedDependency {
        name: name.into(),
        reference: reference(name),
        pinned: PinnedVersion::new(Version::new(1, 0, 0), "v1.0.0", revision),
        dependencies: requires.iter().map(|name| reference(name)).collect(),
        binary: None,
    }
}

fn graph(dependencies: Vec<ResolvedDependency>) -> ResolvedGraph {
    let mut graph = ResolvedGraph::new();
    for dependency in dependencies {
        graph.insert(dependency);
    }
    graph
}

#[derive(Default)]
struct FakeCheckouts {
    existing: Mutex<HashSet<String>>,
    failing: HashSet<String>,
    calls: Mutex<Vec<(String, &'static str)>>,
    active: Mutex<HashSet<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    overlapped: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeCheckouts {
    fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|name| name.to_string()).collect(),
            ..Self::default()
        }
    }

    fn calls(&self, kind: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, call)| *call == kind)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn enter(&self, dependency: &ResolvedDependency, call: &'static str) {
        let name = dependency.name.to_string();
        if !self.active.lock().unwrap().insert(name.clone()) {
            self.overlapped.fetch_add(1, Ordering::SeqCst);
        }
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        self.calls.lock().unwrap().push((name, call));
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
    }

    fn leave(&self, dependency: &ResolvedDependency) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.active.lock().unwrap().remove(dependency.name.as_str());
    }
}

impl CheckoutBackend for FakeCheckouts {
    fn has_checkout(&self, dependency: &ResolvedDependency) -> bool {
        self.existing
            .lock()
            .unwrap()
            .contains(dependency.name.as_str())
    }

    fn clone_dependency(
        &self,
        dependency: &ResolvedDependency,
        cancel: &CancellationToken,
    ) -> Result<(), GitOperationError> {
        self.enter(dependency, "clone");
        let result = if cancel.is_cancelled() {
            Err(GitOperationError::Cancelled)
        } else if self.failing.contains(dependency.name.as_str()) {
            Err(GitOperationError::CloneRepository {
                source: dependency.reference.raw().to_string(),
                error: git2::Error::from_str("connection refused"),
            })
        } else {
            self.existing
                .lock()
                .unwrap()
                .insert(dependency.name.to_string());
            Ok(())
        };
        self.leave(dependency);
        result
    }

    fn fetch_dependency(
        &self,
        dependency: &ResolvedDependency,
        _cancel: &CancellationToken,
    ) -> Result<bool, GitOperationError> {
        self.enter(dependency, "fetch");
        self.leave(dependency);
        Ok(false)
    }

    fn checkout_dependency(
        &self,
        dependency: &ResolvedDependency,
        _cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, GitOperationError> {
        self.enter(dependency, "checkout");
        self.leave(dependency);
        Ok(Utf8PathBuf::from("/checkouts").join(dependency.name.as_str()))
    }
}

#[derive(Default)]
struct FakeBuilder {
    failing: HashSet<String>,
    empty: HashSet<String>,
    cancel_on: Option<(String, CancellationToken)>,
    built: Mutex<Vec<String>>,
}

impl Builder for FakeBuilder {
    fn build(
        &self,
        dependency: &ResolvedDependency,
        checkout: &Utf8Path,
        _cancel: &CancellationToken,
    ) -> Result<BuildStatus, BuildError> {
        assert_eq!(checkout.file_name(), Some(dependency.name.as_str()));
        self.built.lock().unwrap().push(dependency.name.to_string());
        if let Some((name, cancel)) = &self.cancel_on
            && name == dependency.name.as_str()
        {
            cancel.cancel();
            return Err(BuildError::new(dependency.name.clone(), "interrupted"));
        }
        if self.failing.contains(dependency.name.as_str()) {
            return Err(BuildError::new(dependency.name.clone(), "exit status 1"));
        }
        if self.empty.contains(dependency.name.as_str()) {
            return Ok(BuildStatus::NothingToBuild("no build targets".into()));
        }
        Ok(BuildStatus::Built)
    }
}

impl FakeBuilder {
    fn built(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct FakeBinaries {
    definitions: HashMap<Url, BinaryDefinition>,
    broken_archives: bool,
    installed: Mutex<Vec<String>>,
}

impl BinaryFetcher for FakeBinaries {
    fn definition(&self, url: &Url) -> Result<BinaryDefinition, BinaryFetchError> {
        self.definitions
            .get(url)
            .cloned()
            .ok_or_else(|| BinaryFetchError::new(url, "404 Not Found"))
    }

    fn download(
        &self,
        dependency: &ResolvedDependency,
        _release: &BinaryRelease,
        _cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, BinaryFetchError> {
        Ok(Utf8PathBuf::from("/downloads").join(format!("{}.zip", dependency.name)))
    }

    fn install(
        &self,
        dependency: &ResolvedDependency,
        release: &BinaryRelease,
        _archive: &Utf8Path,
    ) -> Result<(), BinaryFetchError> {
        if self.broken_archives {
            return Err(BinaryFetchError::new(&release.url, "corrupt archive"));
        }
        self.installed
            .lock()
            .unwrap()
            .push(dependency.name.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ProjectEvent>>,
}

impl EventSink for Recorder {
    fn put(&self, event: ProjectEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl Recorder {
    fn of(&self, name: &str) -> Vec<ProjectEventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.dependency == name)
            .map(|event| event.kind.clone())
            .collect()
    }
}

fn checking_out() -> ProjectEventKind {
    ProjectEventKind::CheckingOut {
        revision: "v1.0.0".into(),
    }
}

fn run_build(
    graph: &ResolvedGraph,
    checkouts: &FakeCheckouts,
    builder: &FakeBuilder,
    events: &Recorder,
    cache: BuildCache,
) -> (PipelineReport, BuildCache) {
    let pipeline = Pipeline::new(
        checkouts,
        events,
        PipelineMode::Build {
            builder,
            binaries: None,
        },
    )
    .with_cache(cache);
    let report = schedule(&pipeline, graph, 4).unwrap();
    (report, pipeline.into_cache())
}

fn completion(report: &PipelineReport, name: &str) -> Completion {
    match report.get(name) {
        Some(NodeOutcome::Done(completion)) => *completion,
        other => panic!("{name} did not finish: {other:?}"),
    }
}

#[test]
fn independent_dependencies_survive_a_failed_checkout() {
    let graph = graph(vec![
        dependency("alpha", "a1", &[]),
        dependency("beta", "b1", &[]),
        dependency("gamma", "c1", &[]),
    ]);
    let checkouts = FakeCheckouts::failing(&["beta"]);
    let events = Recorder::default();
    let pipeline = Pipeline::new(&checkouts, &events, PipelineMode::Checkout);
    let report = schedule(&pipeline, &graph, 3).unwrap();

    assert!(!report.is_success());
    let failures: Vec<_> = report.failures().map(|(name, _)| name.to_string()).collect();
    assert_eq!(failures, vec!["beta"]);
    assert!(matches!(
        report.get("beta"),
        Some(NodeOutcome::Failed(NodeFailure::Git(_)))
    ));
    let successes: Vec<_> = report.successes().collect();
    assert_eq!(successes.len(), 2);
    assert!(
        successes
            .iter()
            .all(|(_, completion)| *completion == Completion::CheckedOut)
    );
    assert_eq!(events.of("beta"), vec![ProjectEventKind::Cloning]);
}

#[test]
fn dependents_of_a_failed_build_are_not_attempted() {
    let graph = graph(vec![
        dependency("core", "c1", &[]),
        dependency("net", "n1", &["core"]),
        dependency("app", "a1", &["net"]),
        dependency("log", "l1", &[]),
    ]);
    let checkouts = FakeCheckouts::default();
    let builder = FakeBuilder {
        failing: HashSet::from(["core".to_string()]),
        ..FakeBuilder::default()
    };
    let events = Recorder::default();
    let (report, cache) = run_build(&graph, &checkouts, &builder, &events, BuildCache::new());

    assert!(matches!(
        report.get("core"),
        Some(NodeOutcome::Failed(NodeFailure::Build(_)))
    ));
    assert!(matches!(
        report.get("net"),
        Some(NodeOutcome::Failed(NodeFailure::DependencyFailed { dependency })) if dependency == "core"
    ));
    assert!(matches!(
        report.get("app"),
        Some(NodeOutcome::Failed(NodeFailure::DependencyFailed { dependency })) if dependency == "net"
    ));
    assert_eq!(completion(&report, "log"), Completion::Built);

    let mut built = builder.built();
    built.sort();
    assert_eq!(built, vec!["core", "log"]);
    assert!(!checkouts.calls("clone").contains(&"net".to_string()));
    assert!(events.of("app").is_empty());
    assert!(cache.get(&reference("core")).is_none());
    assert!(cache.get(&reference("log")).is_some());
}

#[test]
fn report_lists_dependencies_before_dependents() {
    let graph = graph(vec![
        dependency("app", "a1", &["net"]),
        dependency("net", "n1", &["core"]),
        dependency("core", "c1", &[]),
    ]);
    let checkouts = FakeCheckouts::default();
    let events = Recorder::default();
    let pipeline = Pipeline::new(&checkouts, &events, PipelineMode::Checkout);
    let report = schedule(&pipeline, &graph, 2).unwrap();
    let names: Vec<_> = report.outcomes.keys().map(|name| name.as_str()).collect();
    assert_eq!(names, vec!["core", "net", "app"]);

    // Each checkout only starts after its requirement finished.
    let order = checkouts.calls("checkout");
    assert_eq!(order, vec!["core", "net", "app"]);
}

#[test]
fn changed_upstream_revision_rebuilds_dependents() {
    let checkouts = FakeCheckouts::default();
    let builder = FakeBuilder::default();

    let first = graph(vec![
        dependency("core", "c1", &[]),
        dependency("app", "a1", &["core"]),
    ]);
    let events = Recorder::default();
    let (report, cache) = run_build(&first, &checkouts, &builder, &events, BuildCache::new());
    assert_eq!(completion(&report, "core"), Completion::Built);
    assert_eq!(completion(&report, "app"), Completion::Built);
    assert_eq!(
        events.of("app"),
        vec![
            ProjectEventKind::Cloning,
            checking_out(),
            ProjectEventKind::BuildingUncached
        ]
    );

    let events = Recorder::default();
    let (report, cache) = run_build(&first, &checkouts, &builder, &events, cache);
    assert_eq!(completion(&report, "core"), Completion::SkippedCached);
    assert_eq!(completion(&report, "app"), Completion::SkippedCached);
    assert_eq!(
        events.of("app"),
        vec![
            ProjectEventKind::Fetching,
            checking_out(),
            ProjectEventKind::SkippedBuildingCached
        ]
    );

    let second = graph(vec![
        dependency("core", "c2", &[]),
        dependency("app", "a1", &["core"]),
    ]);
    let events = Recorder::default();
    let (report, _) = run_build(&second, &checkouts, &builder, &events, cache);
    assert_eq!(completion(&report, "core"), Completion::Rebuilt);
    assert_eq!(completion(&report, "app"), Completion::Rebuilt);
    assert_eq!(
        events.of("app").last(),
        Some(&ProjectEventKind::RebuildingCached)
    );
    assert_eq!(builder.built().len(), 4);
}

#[test]
fn rebuilt_upstream_with_same_revision_still_invalidates() {
    let checkouts = FakeCheckouts::default();
    let builder = FakeBuilder::default();
    let graph = graph(vec![
        dependency("core", "c1", &[]),
        dependency("app", "a1", &["core"]),
    ]);
    let (_, mut cache) = run_build(
        &graph,
        &checkouts,
        &builder,
        &Recorder::default(),
        BuildCache::new(),
    );

    // A lost build of `core` forces it to build again, and `app` with it.
    cache.invalidate(&reference("core"));
    let (report, _) = run_build(&graph, &checkouts, &builder, &Recorder::default(), cache);
    assert_eq!(completion(&report, "core"), Completion::Built);
    assert_eq!(completion(&report, "app"), Completion::Rebuilt);
}

#[test]
fn upstream_rebuilds_in_a_partial_run_invalidate_dependents_later() {
    let checkouts = FakeCheckouts::default();
    let builder = FakeBuilder::default();
    let chain = |core: &str| {
        graph(vec![
            dependency("core", core, &[]),
            dependency("net", "n1", &["core"]),
            dependency("app", "a1", &["net"]),
        ])
    };
    let (_, cache) = run_build(
        &chain("c1"),
        &checkouts,
        &builder,
        &Recorder::default(),
        BuildCache::new(),
    );

    // Only `net` is selected; `app` never sees the new `core`.
    let subset = chain("c2").closure_of(&[SmolStr::new("net")]).unwrap();
    let (report, cache) = run_build(&subset, &checkouts, &builder, &Recorder::default(), cache);
    assert_eq!(completion(&report, "core"), Completion::Rebuilt);
    assert_eq!(completion(&report, "net"), Completion::Rebuilt);
    assert!(report.get("app").is_none());

    let events = Recorder::default();
    let (report, _) = run_build(&chain("c2"), &checkouts, &builder, &events, cache);
    assert_eq!(completion(&report, "core"), Completion::SkippedCached);
    assert_eq!(completion(&report, "net"), Completion::SkippedCached);
    assert_eq!(completion(&report, "app"), Completion::Rebuilt);
    assert_eq!(
        events.of("app").last(),
        Some(&ProjectEventKind::RebuildingCached)
    );
}

#[test]
fn dependencies_sharing_a_name_are_rejected_before_any_work() {
    let mut other = dependency("utils", "u2", &[]);
    other.reference = GitReference::new("https://example.com/other/utils.git");
    let graph = graph(vec![dependency("utils", "u1", &[]), other]);
    let checkouts = FakeCheckouts::default();
    let events = Recorder::default();
    let pipeline = Pipeline::new(&checkouts, &events, PipelineMode::Checkout);

    let error = schedule(&pipeline, &graph, 2).unwrap_err();
    assert!(matches!(
        &error,
        ScheduleError::DuplicateName { name, .. } if name == "utils"
    ));
    assert!(checkouts.calls("clone").is_empty());
}

#[test]
fn nothing_to_build_is_reported() {
    let graph = graph(vec![dependency("docs", "d1", &[])]);
    let checkouts = FakeCheckouts::default();
    let builder = FakeBuilder {
        empty: HashSet::from(["docs".to_string()]),
        ..FakeBuilder::default()
    };
    let events = Recorder::default();
    let (report, cache) = run_build(&graph, &checkouts, &builder, &events, BuildCache::new());
    assert_eq!(completion(&report, "docs"), Completion::NothingToBuild);
    assert_eq!(
        events.of("docs").last(),
        Some(&ProjectEventKind::SkippedBuilding {
            reason: "no build targets".into()
        })
    );
    assert!(cache.get(&reference("docs")).is_some());
}

fn binary_dependency(url: &Url) -> ResolvedDependency {
    let mut dependency = dependency("sdk", "s1", &[]);
    dependency.binary = Some(url.clone());
    dependency
}

fn run_with_binaries(
    graph: &ResolvedGraph,
    checkouts: &FakeCheckouts,
    binaries: &FakeBinaries,
    events: &Recorder,
) -> PipelineReport {
    let builder = FakeBuilder::default();
    let pipeline = Pipeline::new(
        checkouts,
        events,
        PipelineMode::Build {
            builder: &builder,
            binaries: Some(binaries),
        },
    );
    schedule(&pipeline, graph, 1).unwrap()
}

#[test]
fn prebuilt_binary_skips_checkout() {
    let url = Url::parse("https://example.com/sdk.json").unwrap();
    let archive = Url::parse("https://example.com/sdk-1.0.0.zip").unwrap();
    let binaries = FakeBinaries {
        definitions: HashMap::from([(
            url.clone(),
            BinaryDefinition::from_pairs([("1.0.0", archive)]),
        )]),
        ..FakeBinaries::default()
    };
    let checkouts = FakeCheckouts::default();
    let events = Recorder::default();
    let graph = graph(vec![binary_dependency(&url)]);
    let report = run_with_binaries(&graph, &checkouts, &binaries, &events);

    assert_eq!(completion(&report, "sdk"), Completion::InstalledBinary);
    assert_eq!(
        events.of("sdk"),
        vec![
            ProjectEventKind::DownloadingBinaryDefinition { url },
            ProjectEventKind::DownloadingBinary {
                release: "1.0.0".into()
            },
        ]
    );
    assert!(checkouts.calls("clone").is_empty());
    assert_eq!(*binaries.installed.lock().unwrap(), vec!["sdk"]);
}

#[test]
fn missing_binary_falls_back_to_source() {
    let url = Url::parse("https://example.com/sdk.json").unwrap();
    let checkouts = FakeCheckouts::default();
    let events = Recorder::default();
    let graph = graph(vec![binary_dependency(&url)]);
    let report = run_with_binaries(&graph, &checkouts, &FakeBinaries::default(), &events);

    assert_eq!(completion(&report, "sdk"), Completion::Built);
    assert_eq!(
        events.of("sdk"),
        vec![
            ProjectEventKind::DownloadingBinaryDefinition { url: url.clone() },
            ProjectEventKind::SkippedDownloadingBinary {
                reason: format!("{url}: 404 Not Found")
            },
            ProjectEventKind::Cloning,
            checking_out(),
            ProjectEventKind::BuildingUncached,
        ]
    );
}

#[test]
fn broken_binary_install_falls_back_to_source() {
    let url = Url::parse("https://example.com/sdk.json").unwrap();
    let archive = Url::parse("https://example.com/sdk-1.0.0.zip").unwrap();
    let binaries = FakeBinaries {
        definitions: HashMap::from([(
            url.clone(),
            BinaryDefinition::from_pairs([("1.0.0", archive.clone())]),
        )]),
        broken_archives: true,
        ..FakeBinaries::default()
    };
    let checkouts = FakeCheckouts::default();
    let events = Recorder::default();
    let graph = graph(vec![binary_dependency(&url)]);
    let report = run_with_binaries(&graph, &checkouts, &binaries, &events);

    assert_eq!(completion(&report, "sdk"), Completion::Built);
    let kinds = events.of("sdk");
    assert_eq!(
        kinds[2],
        ProjectEventKind::SkippedInstallingBinary {
            error: format!("{archive}: corrupt archive")
        }
    );
    assert_eq!(kinds[3], ProjectEventKind::Cloning);
}

#[test]
fn cancelled_pipeline_starts_nothing() {
    let graph = graph(vec![
        dependency("alpha", "a1", &[]),
        dependency("beta", "b1", &["alpha"]),
    ]);
    let checkouts = FakeCheckouts::default();
    let events = Recorder::default();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let pipeline =
        Pipeline::new(&checkouts, &events, PipelineMode::Checkout).with_cancellation(cancel);
    let report = schedule(&pipeline, &graph, 2).unwrap();

    assert!(!report.is_success());
    assert!(
        report
            .failures()
            .all(|(_, failure)| matches!(failure, NodeFailure::Cancelled))
    );
    assert_eq!(report.failures().count(), 2);
    assert!(checkouts.calls("clone").is_empty());
}

#[test]
fn cancellation_keeps_finished_work_and_stops_the_rest() {
    let cancel = CancellationToken::new();
    let graph = graph(vec![
        dependency("core", "c1", &[]),
        dependency("net", "n1", &["core"]),
        dependency("app", "a1", &["net"]),
    ]);
    let checkouts = FakeCheckouts::default();
    let builder = FakeBuilder {
        cancel_on: Some(("net".to_string(), cancel.clone())),
        ..FakeBuilder::default()
    };
    let events = Recorder::default();
    let pipeline = Pipeline::new(
        &checkouts,
        &events,
        PipelineMode::Build {
            builder: &builder,
            binaries: None,
        },
    )
    .with_cancellation(cancel);
    let report = schedule(&pipeline, &graph, 2).unwrap();
    let cache = pipeline.into_cache();

    assert_eq!(completion(&report, "core"), Completion::Built);
    assert!(matches!(
        report.get("net"),
        Some(NodeOutcome::Failed(NodeFailure::Cancelled))
    ));
    assert!(matches!(
        report.get("app"),
        Some(NodeOutcome::Failed(NodeFailure::Cancelled))
    ));
    assert!(cache.get(&reference("core")).is_some());
    assert!(cache.get(&reference("net")).is_none());
    assert!(!checkouts.calls("clone").contains(&"app".to_string()));
}

#[test]
fn concurrency_stays_within_bounds() {
    let names: Vec<String> = (0..8).map(|index| format!("dep{index}")).collect();
    let graph = graph(
        names
            .iter()
            .map(|name| dependency(name, "r1", &[]))
            .collect(),
    );
    let checkouts = FakeCheckouts {
        delay: Some(Duration::from_millis(20)),
        ..FakeCheckouts::default()
    };
    let events = Recorder::default();
    let pipeline = Pipeline::new(&checkouts, &events, PipelineMode::Checkout);
    let report = schedule(&pipeline, &graph, 3).unwrap();

    assert!(report.is_success());
    assert!(checkouts.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(checkouts.calls("clone").len(), 8);
}

#[test]
fn one_dependency_is_never_processed_twice_at_once() {
    let checkouts = FakeCheckouts {
        delay: Some(Duration::from_millis(10)),
        ..FakeCheckouts::default()
    };
    let events = Recorder::default();
    let pipeline = Pipeline::new(&checkouts, &events, PipelineMode::Checkout);
    let shared = dependency("shared", "s1", &[]);

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let outcome = pipeline.run(&shared);
                assert!(outcome.is_done());
            });
        }
    });

    assert_eq!(checkouts.overlapped.load(Ordering::SeqCst), 0);
    // Only the first run clones; the rest find the checkout and fetch.
    assert_eq!(checkouts.calls("clone").len(), 1);
    assert_eq!(checkouts.calls("fetch").len(), 3);
}

#[test]
fn second_checkout_only_fetches() {
    let graph = graph(vec![
        dependency("alpha", "a1", &[]),
        dependency("beta", "b1", &[]),
    ]);
    let checkouts = FakeCheckouts::default();
    for _ in 0..2 {
        let events = Recorder::default();
        let pipeline = Pipeline::new(&checkouts, &events, PipelineMode::Checkout);
        assert!(schedule(&pipeline, &graph, 2).unwrap().is_success());
    }
    assert_eq!(checkouts.calls("clone").len(), 2);
    assert_eq!(checkouts.calls("fetch").len(), 2);
}
