use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;

use super::{Dependency, Requester, SpellingConflict};
use crate::{GitReference, ManifestEntry};

/// A `requires` cycle, listed from the requester back around to itself.
pub type CyclePath = Vec<GitReference>;

/// Journal position to roll the graph back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

#[derive(Debug)]
enum GraphDelta {
    Dependency,
    Constraint(NodeIndex),
    Spelling(NodeIndex),
    Binary(NodeIndex),
    Edge(EdgeIndex),
}

/// Transitive dependency structure discovered while resolving.
///
/// Every mutation is journaled so the resolver can discard exactly what a
/// search branch added. Rollback is strictly last-in first-out, which keeps
/// petgraph node and edge indices stable for everything that remains.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<GitReference, ()>,
    dependencies: IndexMap<GitReference, Dependency>,
    journal: Vec<GraphDelta>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.journal.len())
    }

    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        while self.journal.len() > checkpoint.0 {
            let Some(delta) = self.journal.pop() else {
                break;
            };
            match delta {
                GraphDelta::Dependency => {
                    self.dependencies.pop();
                    let last = NodeIndex::new(self.graph.node_count() - 1);
                    self.graph.remove_node(last);
                }
                GraphDelta::Constraint(node) => {
                    self.dependency_at_mut(node).constraints.pop();
                }
                GraphDelta::Spelling(node) => {
                    self.dependency_at_mut(node).spellings.pop();
                }
                GraphDelta::Binary(node) => {
                    self.dependency_at_mut(node).binary = None;
                }
                GraphDelta::Edge(edge) => {
                    self.graph.remove_edge(edge);
                }
            }
        }
    }

    /// Records that `requester` depends on `entry`.
    ///
    /// Fails without mutating the graph when the new edge would close a
    /// `requires` cycle.
    pub fn add_requirement(
        &mut self,
        requester: &Requester,
        entry: &ManifestEntry,
    ) -> Result<(), CyclePath> {
        if let Requester::Dependency(from) = requester {
            if let Some(path) = self.cycle_through(from, &entry.reference) {
                return Err(path);
            }
        }

        let target = self.ensure_dependency(entry);
        let dependency = self.dependency_at_mut(target);
        dependency
            .constraints
            .push((requester.clone(), entry.constraint.clone()));
        let add_spelling = !dependency
            .spellings
            .iter()
            .any(|spelling| spelling == entry.reference.raw());
        if add_spelling {
            dependency.spellings.push(entry.reference.raw().to_string());
        }
        let add_binary = dependency.binary.is_none() && entry.binary.is_some();
        if add_binary {
            dependency.binary = entry.binary.clone();
        }
        self.journal.push(GraphDelta::Constraint(target));
        if add_spelling {
            self.journal.push(GraphDelta::Spelling(target));
        }
        if add_binary {
            self.journal.push(GraphDelta::Binary(target));
        }

        if let Requester::Dependency(from) = requester
            && let Some(source) = self.node_index(from)
            && self.graph.find_edge(source, target).is_none()
        {
            let edge = self.graph.add_edge(source, target, ());
            self.journal.push(GraphDelta::Edge(edge));
        }
        Ok(())
    }

    pub fn get(&self, identity: &GitReference) -> Option<&Dependency> {
        self.dependencies.get(identity)
    }

    pub fn contains(&self, identity: &GitReference) -> bool {
        self.dependencies.contains_key(identity)
    }

    /// Dependencies in the order they were first discovered.
    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.values()
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Direct requirements of `identity`, in the order they were declared.
    pub fn requirements_of(&self, identity: &GitReference) -> Vec<GitReference> {
        let Some(node) = self.node_index(identity) else {
            return Vec::new();
        };
        let mut edges: Vec<_> = self
            .graph
            .edges(node)
            .map(|edge| (edge.id(), edge.target()))
            .collect();
        edges.sort_by_key(|(id, _)| id.index());
        edges
            .into_iter()
            .map(|(_, target)| self.graph[target].clone())
            .collect()
    }

    pub fn spelling_conflicts(&self) -> Vec<SpellingConflict> {
        self.dependencies
            .values()
            .filter(|dependency| dependency.has_conflicting_spellings())
            .map(|dependency| SpellingConflict {
                identity: dependency.identity.normalized().to_string(),
                spellings: dependency.spellings.clone(),
            })
            .collect()
    }

    fn node_index(&self, identity: &GitReference) -> Option<NodeIndex> {
        self.dependencies
            .get_index_of(identity)
            .map(NodeIndex::new)
    }

    fn dependency_at_mut(&mut self, node: NodeIndex) -> &mut Dependency {
        &mut self.dependencies[node.index()]
    }

    fn ensure_dependency(&mut self, entry: &ManifestEntry) -> NodeIndex {
        if let Some(node) = self.node_index(&entry.reference) {
            return node;
        }
        let node = self.graph.add_node(entry.reference.clone());
        debug_assert_eq!(node.index(), self.dependencies.len());
        self.dependencies.insert(
            entry.reference.clone(),
            Dependency {
                identity: entry.reference.clone(),
                name: entry.name.clone(),
                constraints: Vec::new(),
                spellings: Vec::new(),
                binary: None,
            },
        );
        self.journal.push(GraphDelta::Dependency);
        node
    }

    /// Path `from -> to -> ... -> from` if adding `from -> to` closes a cycle.
    fn cycle_through(&self, from: &GitReference, to: &GitReference) -> Option<CyclePath> {
        if from == to {
            return Some(vec![from.clone(), to.clone()]);
        }
        let start = self.node_index(to)?;
        let goal = self.node_index(from)?;

        let mut previous: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            if node == goal {
                let mut path = vec![self.graph[goal].clone()];
                let mut current = goal;
                while let Some(&prior) = previous.get(&current) {
                    path.push(self.graph[prior].clone());
                    current = prior;
                }
                path.push(from.clone());
                path.reverse();
                return Some(path);
            }
            for next in self.graph.neighbors(node) {
                if next != start && !previous.contains_key(&next) {
                    previous.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        None
    }
}
