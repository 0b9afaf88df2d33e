//! Runs the pipeline over a resolved graph on a bounded pool of worker
//! threads. A dependency is dispatched only after everything it requires
//! reached a terminal state.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Condvar, Mutex, PoisonError, mpsc},
    thread,
};

use common::{
    GitReference,
    resolved::{ResolvedDependency, ResolvedGraph},
};
use indexmap::IndexMap;
use smol_str::SmolStr;
use thiserror::Error;

use crate::pipeline::{NodeFailure, NodeOutcome, Pipeline, PipelineReport};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("dependency graph contains a cycle through {dependency}")]
    Cycle { dependency: SmolStr },
    #[error("{first} and {second} are both named {name}")]
    DuplicateName {
        name: SmolStr,
        first: String,
        second: String,
    },
}

struct WorkQueue<T> {
    state: Mutex<WorkQueueState<T>>,
    available: Condvar,
}

struct WorkQueueState<T> {
    queue: VecDeque<T>,
    closed: bool,
}

impl<T> WorkQueue<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(WorkQueueState {
                queue: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn push(&self, task: T) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return;
        }
        state.queue.push_back(task);
        self.available.notify_one();
    }

    fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(task) = state.queue.pop_front() {
                return Some(task);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        self.available.notify_all();
    }
}

/// Bookkeeping for which dependencies are waiting, ready or finished.
struct Schedule<'g> {
    graph: &'g ResolvedGraph,
    order: Vec<GitReference>,
    waiting: HashMap<GitReference, usize>,
    dependents: HashMap<GitReference, Vec<GitReference>>,
    ready: VecDeque<GitReference>,
    outcomes: HashMap<GitReference, NodeOutcome>,
}

impl<'g> Schedule<'g> {
    fn new(graph: &'g ResolvedGraph) -> Result<Self, ScheduleError> {
        if let Some((first, second)) = graph.duplicate_name() {
            return Err(ScheduleError::DuplicateName {
                name: first.name.clone(),
                first: first.reference.normalized().to_string(),
                second: second.reference.normalized().to_string(),
            });
        }
        let order = graph.topological_order().map_err(|identity| ScheduleError::Cycle {
            dependency: graph
                .get(&identity)
                .map(|dependency| dependency.name.clone())
                .unwrap_or_else(|| SmolStr::new(identity.normalized())),
        })?;

        let mut waiting = HashMap::new();
        let mut dependents: HashMap<GitReference, Vec<GitReference>> = HashMap::new();
        let mut ready = VecDeque::new();
        for identity in &order {
            let Some(dependency) = graph.get(identity) else {
                continue;
            };
            let required: Vec<&GitReference> = dependency
                .dependencies
                .iter()
                .filter(|required| graph.get(required).is_some())
                .collect();
            for required in &required {
                dependents
                    .entry((*required).clone())
                    .or_default()
                    .push(identity.clone());
            }
            if required.is_empty() {
                ready.push_back(identity.clone());
            } else {
                waiting.insert(identity.clone(), required.len());
            }
        }

        Ok(Self {
            graph,
            order,
            waiting,
            dependents,
            ready,
            outcomes: HashMap::new(),
        })
    }

    /// Pops the next dependency whose requirements all finished. Ones that
    /// cannot run (cancelled, or a requirement failed) are settled on the
    /// spot and never returned.
    fn next_task(&mut self, pipeline: &Pipeline<'_>) -> Option<&'g ResolvedDependency> {
        let graph = self.graph;
        while let Some(identity) = self.ready.pop_front() {
            let Some(dependency) = graph.get(&identity) else {
                continue;
            };
            if pipeline.cancellation().is_cancelled() {
                self.complete(identity, NodeOutcome::Failed(NodeFailure::Cancelled));
                continue;
            }
            if let Some(failed) = self.failed_requirement(dependency) {
                tracing::info!(
                    target: "pipeline",
                    "Skipping {} because {} failed",
                    dependency.name,
                    failed
                );
                self.complete(
                    identity,
                    NodeOutcome::Failed(NodeFailure::DependencyFailed { dependency: failed }),
                );
                continue;
            }
            return Some(dependency);
        }
        None
    }

    fn failed_requirement(&self, dependency: &ResolvedDependency) -> Option<SmolStr> {
        dependency.dependencies.iter().find_map(|required| {
            match self.outcomes.get(required) {
                Some(NodeOutcome::Failed(_)) => self
                    .graph
                    .get(required)
                    .map(|required| required.name.clone()),
                _ => None,
            }
        })
    }

    fn complete(&mut self, identity: GitReference, outcome: NodeOutcome) {
        if let Some(dependents) = self.dependents.get(&identity) {
            for dependent in dependents {
                if let Some(count) = self.waiting.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        self.waiting.remove(dependent);
                        self.ready.push_back(dependent.clone());
                    }
                }
            }
        }
        self.outcomes.insert(identity, outcome);
    }

    fn into_report(mut self) -> PipelineReport {
        let graph = self.graph;
        let mut outcomes = IndexMap::new();
        for identity in &self.order {
            let (Some(dependency), Some(outcome)) =
                (graph.get(identity), self.outcomes.remove(identity))
            else {
                continue;
            };
            outcomes.insert(dependency.name.clone(), outcome);
        }
        PipelineReport { outcomes }
    }
}

/// Drives every dependency of `graph` through `pipeline` with at most
/// `max_concurrency` running at once.
pub fn schedule(
    pipeline: &Pipeline<'_>,
    graph: &ResolvedGraph,
    max_concurrency: usize,
) -> Result<PipelineReport, ScheduleError> {
    let mut schedule = Schedule::new(graph)?;
    let workers = max_concurrency.clamp(1, graph.len().max(1));
    tracing::info!(
        target: "pipeline",
        "Processing {} dependencies on {} workers",
        graph.len(),
        workers
    );

    let work_queue = WorkQueue::<&ResolvedDependency>::new();
    let (result_tx, result_rx) = mpsc::channel::<(GitReference, NodeOutcome)>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let queue = &work_queue;
            let tx = result_tx.clone();
            scope.spawn(move || {
                while let Some(dependency) = queue.pop() {
                    let outcome = pipeline.run(dependency);
                    if tx.send((dependency.reference.clone(), outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut in_flight = 0;
        loop {
            while in_flight < workers {
                let Some(dependency) = schedule.next_task(pipeline) else {
                    break;
                };
                in_flight += 1;
                work_queue.push(dependency);
            }
            if in_flight == 0 {
                break;
            }
            let Ok((identity, outcome)) = result_rx.recv() else {
                break;
            };
            in_flight -= 1;
            schedule.complete(identity, outcome);
        }
        work_queue.close();
    });

    Ok(schedule.into_report())
}
