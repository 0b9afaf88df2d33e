use std::{collections::HashMap, fmt, fs, io};

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::{IndexMap, IndexSet};
use petgraph::{algo::toposort, graph::DiGraph};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

use crate::{
    GitReference, PinnedVersion, Version, dependencies::SpellingConflict, version::parse_tag,
};

/// The version chosen for one dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub name: SmolStr,
    pub reference: GitReference,
    pub pinned: PinnedVersion,
    /// Identities this dependency requires, in declaration order.
    pub dependencies: Vec<GitReference>,
    pub binary: Option<Url>,
}

impl ResolvedDependency {
    pub fn version(&self) -> &Version {
        &self.pinned.version
    }

    pub fn revision(&self) -> &str {
        &self.pinned.revision
    }
}

/// One concrete version per dependency identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedGraph {
    entries: IndexMap<GitReference, ResolvedDependency>,
    spelling_conflicts: Vec<SpellingConflict>,
}

impl ResolvedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dependency: ResolvedDependency) {
        self.entries.insert(dependency.reference.clone(), dependency);
    }

    pub fn with_spelling_conflicts(mut self, conflicts: Vec<SpellingConflict>) -> Self {
        self.spelling_conflicts = conflicts;
        self
    }

    pub fn spelling_conflicts(&self) -> &[SpellingConflict] {
        &self.spelling_conflicts
    }

    pub fn get(&self, identity: &GitReference) -> Option<&ResolvedDependency> {
        self.entries.get(identity)
    }

    pub fn by_name(&self, name: &str) -> Option<&ResolvedDependency> {
        self.entries.values().find(|dependency| dependency.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedDependency> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Two dependencies with different identities but the same name. Names
    /// key checkout directories and reports, so they must be unique.
    pub fn duplicate_name(&self) -> Option<(&ResolvedDependency, &ResolvedDependency)> {
        let mut seen: HashMap<&str, &ResolvedDependency> = HashMap::new();
        for dependency in self.entries.values() {
            if let Some(first) = seen.insert(dependency.name.as_str(), dependency) {
                return Some((first, dependency));
            }
        }
        None
    }

    /// Identities ordered so that every dependency precedes its dependents.
    pub fn topological_order(&self) -> Result<Vec<GitReference>, GitReference> {
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..self.entries.len()).map(|i| graph.add_node(i)).collect();
        for (index, dependency) in self.entries.values().enumerate() {
            for required in &dependency.dependencies {
                if let Some(required_index) = self.entries.get_index_of(required) {
                    graph.add_edge(nodes[required_index], nodes[index], ());
                }
            }
        }
        toposort(&graph, None)
            .map(|order| {
                order
                    .into_iter()
                    .map(|node| self.entries[graph[node]].reference.clone())
                    .collect()
            })
            .map_err(|cycle| self.entries[graph[cycle.node_id()]].reference.clone())
    }

    /// The named dependencies plus everything they transitively require.
    /// Unknown names are returned in the error.
    pub fn closure_of(&self, names: &[SmolStr]) -> Result<ResolvedGraph, Vec<SmolStr>> {
        let unknown: Vec<SmolStr> = names
            .iter()
            .filter(|name| self.by_name(name).is_none())
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(unknown);
        }

        let mut keep: IndexSet<GitReference> = IndexSet::new();
        let mut stack: Vec<GitReference> = names
            .iter()
            .filter_map(|name| self.by_name(name))
            .map(|dependency| dependency.reference.clone())
            .collect();
        while let Some(identity) = stack.pop() {
            if !keep.insert(identity.clone()) {
                continue;
            }
            if let Some(dependency) = self.entries.get(&identity) {
                stack.extend(dependency.dependencies.iter().cloned());
            }
        }

        let entries = self
            .entries
            .iter()
            .filter(|(identity, _)| keep.contains(*identity))
            .map(|(identity, dependency)| (identity.clone(), dependency.clone()))
            .collect();
        Ok(ResolvedGraph {
            entries,
            spelling_conflicts: self.spelling_conflicts.clone(),
        })
    }
}

/// On-disk form of a [`ResolvedGraph`], written so later runs can reuse it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedManifest {
    #[serde(default, rename = "dependency")]
    pub dependencies: Vec<ResolvedRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRecord {
    pub name: String,
    pub source: String,
    pub version: String,
    pub tag: String,
    pub revision: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
}

#[derive(Debug)]
pub enum ResolvedManifestError {
    Read { path: Utf8PathBuf, error: io::Error },
    Write { path: Utf8PathBuf, error: io::Error },
    Parse { path: Utf8PathBuf, error: toml::de::Error },
    Serialize(toml::ser::Error),
    InvalidVersion { name: String, version: String },
    InvalidBinaryUrl { name: String, url: String },
}

impl ResolvedManifest {
    pub fn from_graph(graph: &ResolvedGraph) -> Self {
        let mut dependencies: Vec<ResolvedRecord> = graph
            .iter()
            .map(|dependency| ResolvedRecord {
                name: dependency.name.to_string(),
                source: dependency.reference.raw().to_string(),
                version: dependency.pinned.version.to_string(),
                tag: dependency.pinned.tag.to_string(),
                revision: dependency.pinned.revision.clone(),
                requires: dependency
                    .dependencies
                    .iter()
                    .map(|reference| reference.raw().to_string())
                    .collect(),
                binary: dependency.binary.as_ref().map(|url| url.to_string()),
            })
            .collect();
        dependencies.sort_by(|a, b| a.name.cmp(&b.name));
        Self { dependencies }
    }

    pub fn to_graph(&self) -> Result<ResolvedGraph, ResolvedManifestError> {
        let mut graph = ResolvedGraph::new();
        for record in &self.dependencies {
            let version = Version::parse(&record.version)
                .ok()
                .or_else(|| parse_tag(&record.version))
                .ok_or_else(|| ResolvedManifestError::InvalidVersion {
                    name: record.name.clone(),
                    version: record.version.clone(),
                })?;
            let binary = record
                .binary
                .as_deref()
                .map(|url| {
                    Url::parse(url).map_err(|_| ResolvedManifestError::InvalidBinaryUrl {
                        name: record.name.clone(),
                        url: url.to_string(),
                    })
                })
                .transpose()?;
            graph.insert(ResolvedDependency {
                name: SmolStr::new(&record.name),
                reference: GitReference::new(record.source.clone()),
                pinned: PinnedVersion::new(version, record.tag.as_str(), record.revision.clone()),
                dependencies: record.requires.iter().map(GitReference::new).collect(),
                binary,
            });
        }
        Ok(graph)
    }

    pub fn parse(path: &Utf8Path, content: &str) -> Result<Self, ResolvedManifestError> {
        toml::from_str(content).map_err(|error| ResolvedManifestError::Parse {
            path: path.to_owned(),
            error,
        })
    }

    /// Reads a resolved manifest; a missing file is `Ok(None)`.
    pub fn load(path: &Utf8Path) -> Result<Option<Self>, ResolvedManifestError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(path, &content).map(Some),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(ResolvedManifestError::Read {
                path: path.to_owned(),
                error,
            }),
        }
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), ResolvedManifestError> {
        let content = toml::to_string_pretty(self).map_err(ResolvedManifestError::Serialize)?;
        fs::write(path, content).map_err(|error| ResolvedManifestError::Write {
            path: path.to_owned(),
            error,
        })
    }
}

impl fmt::Display for ResolvedManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedManifestError::Read { path, error } => {
                write!(f, "Failed to read resolved manifest {path}: {error}")
            }
            ResolvedManifestError::Write { path, error } => {
                write!(f, "Failed to write resolved manifest {path}: {error}")
            }
            ResolvedManifestError::Parse { path, error } => {
                write!(f, "Failed to parse resolved manifest {path}: {error}")
            }
            ResolvedManifestError::Serialize(error) => {
                write!(f, "Failed to serialize resolved manifest: {error}")
            }
            ResolvedManifestError::InvalidVersion { name, version } => {
                write!(f, "Resolved manifest lists invalid version '{version}' for {name}")
            }
            ResolvedManifestError::InvalidBinaryUrl { name, url } => {
                write!(f, "Resolved manifest lists invalid binary URL '{url}' for {name}")
            }
        }
    }
}

impl std::error::Error for ResolvedManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolvedManifestError::Read { error, .. } => Some(error),
            ResolvedManifestError::Write { error, .. } => Some(error),
            ResolvedManifestError::Parse { error, .. } => Some(error),
            ResolvedManifestError::Serialize(error) => Some(error),
            ResolvedManifestError::InvalidVersion { .. } => None,
            ResolvedManifestError::InvalidBinaryUrl { .. } => None,
        }
    }
}
