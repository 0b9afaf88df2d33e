//! Records which revision of each dependency was last built successfully,
//! and against which builds of its upstream dependencies.
//!
//! Every recorded build gets a fresh stamp. A dependent's fingerprint
//! covers the stamps of everything it requires, so rebuilding an upstream
//! invalidates all of its dependents, on this run or any later one.

use std::{
    collections::BTreeMap,
    fmt, fs, io,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use camino::{Utf8Path, Utf8PathBuf};
use common::GitReference;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read build cache {path}: {error}")]
    Read { path: Utf8PathBuf, error: io::Error },
    #[error("failed to parse build cache {path}: {error}")]
    Parse {
        path: Utf8PathBuf,
        error: toml::de::Error,
    },
    #[error("failed to serialize build cache: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write build cache {path}: {error}")]
    Write { path: Utf8PathBuf, error: io::Error },
}

fn hex(digest: impl AsRef<[u8]>) -> String {
    let digest = digest.as_ref();
    let mut encoded = String::with_capacity(digest.len() * 2);
    for byte in digest {
        encoded.push_str(&format!("{byte:02x}"));
    }
    encoded
}

/// Digest of a revision together with the upstream builds it is built
/// against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// `upstream` holds the build stamp of each required dependency, in
    /// declaration order.
    pub fn new<'a>(revision: &str, upstream: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(revision.as_bytes());
        for upstream in upstream {
            hasher.update(b"\n");
            hasher.update(upstream.as_bytes());
        }
        Self(hex(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identity: String,
    pub version: String,
    pub revision: String,
    pub fingerprint: Fingerprint,
    /// Unique to the build that produced this entry.
    #[serde(default)]
    pub build: String,
}

static BUILD_COUNTER: AtomicU64 = AtomicU64::new(0);

fn new_build_stamp(fingerprint: &Fingerprint) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    let count = BUILD_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_str().as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(count.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hex(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Built from this revision against the current upstream builds.
    Valid,
    /// Built before, but the revision changed or an upstream was rebuilt.
    Invalid,
    Missing,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default, rename = "entry")]
    entries: Vec<CacheEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildCache {
    entries: BTreeMap<String, CacheEntry>,
}

impl BuildCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the cache at `path`. A missing file is an empty cache.
    pub fn load(path: &Utf8Path) -> Result<Self, CacheError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(error) => {
                return Err(CacheError::Read {
                    path: path.to_owned(),
                    error,
                });
            }
        };
        let file: CacheFile = toml::from_str(&content).map_err(|error| CacheError::Parse {
            path: path.to_owned(),
            error,
        })?;
        Ok(Self {
            entries: file
                .entries
                .into_iter()
                .map(|entry| (entry.identity.clone(), entry))
                .collect(),
        })
    }

    /// Like [`BuildCache::load`], but an unusable cache only costs rebuilds.
    pub fn load_or_default(path: &Utf8Path) -> Self {
        Self::load(path).unwrap_or_else(|error| {
            tracing::warn!(target: "pipeline", "{error}; starting with an empty build cache");
            Self::new()
        })
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), CacheError> {
        let file = CacheFile {
            entries: self.entries.values().cloned().collect(),
        };
        let content = toml::to_string_pretty(&file)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| CacheError::Write {
                path: path.to_owned(),
                error,
            })?;
        }
        fs::write(path, content).map_err(|error| CacheError::Write {
            path: path.to_owned(),
            error,
        })
    }

    pub fn get(&self, identity: &GitReference) -> Option<&CacheEntry> {
        self.entries.get(identity.normalized())
    }

    /// Stamp of the last recorded build of `identity`.
    pub fn build_stamp(&self, identity: &GitReference) -> Option<&str> {
        self.get(identity).map(|entry| entry.build.as_str())
    }

    pub fn is_valid(&self, identity: &GitReference, fingerprint: &Fingerprint) -> bool {
        self.get(identity)
            .is_some_and(|entry| entry.fingerprint == *fingerprint)
    }

    pub fn status(&self, identity: &GitReference, fingerprint: &Fingerprint) -> CacheStatus {
        if self.is_valid(identity, fingerprint) {
            CacheStatus::Valid
        } else if self.get(identity).is_some() {
            CacheStatus::Invalid
        } else {
            CacheStatus::Missing
        }
    }

    /// Records a successful build under a new stamp.
    pub fn record(
        &mut self,
        identity: &GitReference,
        version: impl Into<String>,
        revision: impl Into<String>,
        fingerprint: Fingerprint,
    ) {
        let identity = identity.normalized().to_string();
        let build = new_build_stamp(&fingerprint);
        self.entries.insert(
            identity.clone(),
            CacheEntry {
                identity,
                version: version.into(),
                revision: revision.into(),
                fingerprint,
                build,
            },
        );
    }

    pub fn invalidate(&mut self, identity: &GitReference) -> Option<CacheEntry> {
        self.entries.remove(identity.normalized())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
