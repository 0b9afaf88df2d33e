use std::{
    collections::{HashMap, HashSet},
    fmt, fs, io,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use camino::{Utf8Path, Utf8PathBuf};
use common::{GitReference, PinnedVersion, version::parse_tag};
use git2::{
    AutotagOption, FetchOptions, Oid, RemoteCallbacks, Repository, build::CheckoutBuilder,
};
use sha2::{Digest, Sha256};

use crate::CancellationToken;

const MIRROR_REFSPECS: [&str; 2] = ["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"];
const CHECKOUT_REFSPECS: [&str; 2] = [
    "+refs/heads/*:refs/remotes/origin/*",
    "+refs/tags/*:refs/tags/*",
];

/// Git access for dependencies: bare mirrors used while resolving, and
/// working checkouts materialized by the pipeline.
///
/// Mirrors are fetched at most once per `GitResolver`; later requests reuse
/// what is already on disk.
#[derive(Debug)]
pub struct GitResolver {
    pub checkouts_root: Utf8PathBuf,
    pub repositories_root: Utf8PathBuf,
    fetch_retries: u32,
    prefer_ssh: bool,
    fetched: Mutex<HashSet<GitReference>>,
    locks: Mutex<HashMap<Utf8PathBuf, Arc<Mutex<()>>>>,
}

impl GitResolver {
    pub fn new(
        checkouts_root: impl Into<Utf8PathBuf>,
        repositories_root: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            checkouts_root: checkouts_root.into(),
            repositories_root: repositories_root.into(),
            fetch_retries: 0,
            prefer_ssh: false,
            fetched: Mutex::new(HashSet::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_fetch_retries(mut self, fetch_retries: u32) -> Self {
        self.fetch_retries = fetch_retries;
        self
    }

    /// Talk to `http(s)` remotes over SSH instead.
    pub fn with_ssh(mut self, prefer_ssh: bool) -> Self {
        self.prefer_ssh = prefer_ssh;
        self
    }

    /// The address git operations use for `reference`.
    pub fn remote_url(&self, reference: &GitReference) -> String {
        if self.prefer_ssh
            && let Some(ssh) = reference.ssh_url()
        {
            return ssh;
        }
        reference.raw().to_string()
    }

    pub fn checkout_path(&self, name: &str) -> Utf8PathBuf {
        self.checkouts_root.join(name)
    }

    pub fn mirror_path(&self, reference: &GitReference) -> Utf8PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(reference.normalized().as_bytes());
        let digest = hasher.finalize();
        let mut encoded = String::with_capacity(16);
        for byte in &digest[..8] {
            encoded.push_str(&format!("{byte:02x}"));
        }
        let name = reference.name().unwrap_or_default();
        self.repositories_root.join(format!("{name}-{encoded}"))
    }

    /// Tags of `reference` that parse as versions, each pinned to its commit.
    pub fn available_versions(
        &self,
        reference: &GitReference,
        cancel: &CancellationToken,
    ) -> Result<Vec<PinnedVersion>, GitOperationError> {
        let repo = self.ensure_mirror(reference, cancel)?;
        let tags = repo
            .tag_names(None)
            .map_err(|error| GitOperationError::ReadTags {
                source: reference.raw().to_string(),
                error,
            })?;

        let mut versions = Vec::new();
        for tag in tags.iter().flatten() {
            let Some(version) = parse_tag(tag) else {
                continue;
            };
            let commit = repo
                .revparse_single(&format!("refs/tags/{tag}"))
                .and_then(|object| object.peel_to_commit())
                .map_err(|error| GitOperationError::RevisionLookup {
                    rev: tag.to_string(),
                    error,
                })?;
            versions.push(PinnedVersion::new(version, tag, commit.id().to_string()));
        }
        tracing::debug!(
            target: "resolver",
            "Found {} versions of {}",
            versions.len(),
            reference
        );
        Ok(versions)
    }

    /// Contents of `path` at `revision` in the mirror, or `None` when the
    /// file does not exist at that revision.
    pub fn read_file(
        &self,
        reference: &GitReference,
        revision: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, GitOperationError> {
        let repo = self.ensure_mirror(reference, cancel)?;
        let oid = Oid::from_str(revision).map_err(|error| GitOperationError::InvalidRevision {
            rev: revision.to_string(),
            error,
        })?;
        let read_error = |error| GitOperationError::ReadFile {
            rev: revision.to_string(),
            path: path.to_string(),
            error,
        };
        let tree = repo
            .find_commit(oid)
            .and_then(|commit| commit.tree())
            .map_err(read_error)?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(error) if error.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(error) => return Err(read_error(error)),
        };
        let blob = entry
            .to_object(&repo)
            .and_then(|object| object.peel_to_blob())
            .map_err(read_error)?;
        Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
    }

    /// Opens the bare mirror of `reference`, creating or updating it first
    /// unless it was already fetched by this resolver.
    pub fn ensure_mirror(
        &self,
        reference: &GitReference,
        cancel: &CancellationToken,
    ) -> Result<Repository, GitOperationError> {
        let path = self.mirror_path(reference);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.was_fetched(reference) {
            return open_repository(&path);
        }

        let url = self.remote_url(reference);
        let repo = if path.exists() {
            tracing::debug!(target: "resolver", "Updating mirror of {}", reference);
            let repo = open_repository(&path)?;
            repo.remote_set_url("origin", &url)
                .map_err(|error| GitOperationError::FetchRepository {
                    source: url.clone(),
                    error,
                })?;
            repo
        } else {
            tracing::info!(target: "resolver", "Creating mirror of {}", reference);
            prepare_directory(&path)?;
            let repo =
                Repository::init_bare(path.as_std_path()).map_err(|error| {
                    GitOperationError::InitRepository {
                        path: path.clone(),
                        error,
                    }
                })?;
            repo.remote("origin", &url)
                .map_err(|error| GitOperationError::FetchRepository {
                    source: url.clone(),
                    error,
                })?;
            repo
        };

        self.fetch_with_retries(&repo, &url, &MIRROR_REFSPECS, cancel)?;
        self.mark_fetched(reference);
        Ok(repo)
    }

    /// True when a working checkout exists at `checkout_path(name)`.
    pub fn has_checkout(&self, name: &str) -> bool {
        let path = self.checkout_path(name);
        path.exists() && Repository::open(path.as_std_path()).is_ok()
    }

    /// Creates the working checkout, seeding it from the local mirror when
    /// one exists so that no second network transfer is needed. The tree
    /// stays empty until [`GitResolver::checkout_revision`].
    pub fn clone_checkout(
        &self,
        name: &str,
        reference: &GitReference,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, GitOperationError> {
        let checkout_path = self.checkout_path(name);
        prepare_directory(&checkout_path)?;

        let url = self.remote_url(reference);
        let mirror = self.mirror_path(reference);
        let clone_source = if mirror.exists() {
            mirror.to_string()
        } else {
            url.clone()
        };

        let repo = Repository::init(checkout_path.as_std_path()).map_err(|error| {
            GitOperationError::InitRepository {
                path: checkout_path.clone(),
                error,
            }
        })?;
        repo.remote("origin", &clone_source)
            .map_err(|error| GitOperationError::CloneRepository {
                source: clone_source.clone(),
                error,
            })?;
        self.fetch_with_retries(&repo, &clone_source, &CHECKOUT_REFSPECS, cancel)?;
        repo.remote_set_url("origin", &url)
            .map_err(|error| GitOperationError::CloneRepository {
                source: url.clone(),
                error,
            })?;
        Ok(checkout_path)
    }

    /// Updates the working checkout's remote-tracking refs. Skips the network
    /// entirely when `revision` is already present.
    pub fn fetch_checkout(
        &self,
        name: &str,
        reference: &GitReference,
        revision: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, GitOperationError> {
        let checkout_path = self.checkout_path(name);
        let repo = open_repository(&checkout_path)?;
        if let Ok(oid) = Oid::from_str(revision)
            && repo.find_object(oid, None).is_ok()
        {
            tracing::debug!(target: "resolver", "{} already has {}", name, revision);
            return Ok(false);
        }
        let url = self.remote_url(reference);
        repo.remote_set_url("origin", &url)
            .map_err(|error| GitOperationError::FetchRepository {
                source: url.clone(),
                error,
            })?;
        self.fetch_with_retries(&repo, &url, &CHECKOUT_REFSPECS, cancel)?;
        Ok(true)
    }

    /// Resets the working tree of the checkout to `revision` (detached).
    pub fn checkout_revision(
        &self,
        name: &str,
        revision: &str,
    ) -> Result<Utf8PathBuf, GitOperationError> {
        let checkout_path = self.checkout_path(name);
        let repo = open_repository(&checkout_path)?;
        let oid = Oid::from_str(revision).map_err(|error| GitOperationError::InvalidRevision {
            rev: revision.to_string(),
            error,
        })?;
        let object =
            repo.find_object(oid, None)
                .map_err(|error| GitOperationError::RevisionLookup {
                    rev: revision.to_string(),
                    error,
                })?;
        let mut builder = CheckoutBuilder::new();
        builder.force();
        repo.checkout_tree(&object, Some(&mut builder))
            .map_err(|error| GitOperationError::Checkout {
                rev: revision.to_string(),
                error,
            })?;
        repo.set_head_detached(oid)
            .map_err(|error| GitOperationError::Checkout {
                rev: revision.to_string(),
                error,
            })?;
        Ok(checkout_path)
    }

    /// Revision the working checkout's HEAD currently points at.
    pub fn checked_out_revision(&self, name: &str) -> Option<String> {
        let repo = Repository::open(self.checkout_path(name).as_std_path()).ok()?;
        let head = repo.head().ok()?;
        head.target().map(|oid| oid.to_string())
    }

    fn fetch_with_retries(
        &self,
        repo: &Repository,
        source: &str,
        refspecs: &[&str],
        cancel: &CancellationToken,
    ) -> Result<(), GitOperationError> {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(GitOperationError::Cancelled);
            }
            let result = repo.find_remote("origin").and_then(|mut remote| {
                let mut options = FetchOptions::new();
                options
                    .remote_callbacks(cancellable_callbacks(cancel))
                    .download_tags(AutotagOption::All);
                remote.fetch(refspecs, Some(&mut options), None)
            });
            match result {
                Ok(()) => return Ok(()),
                Err(_) if cancel.is_cancelled() => return Err(GitOperationError::Cancelled),
                Err(error) if attempt < self.fetch_retries => {
                    attempt += 1;
                    tracing::warn!(
                        target: "resolver",
                        "Fetching {} failed (attempt {}/{}): {}",
                        source,
                        attempt,
                        self.fetch_retries + 1,
                        error
                    );
                }
                Err(error) => {
                    return Err(GitOperationError::FetchRepository {
                        source: source.to_string(),
                        error,
                    });
                }
            }
        }
    }

    fn lock_for(&self, path: &Utf8Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(path.to_owned()).or_default().clone()
    }

    fn was_fetched(&self, reference: &GitReference) -> bool {
        self.fetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(reference)
    }

    fn mark_fetched(&self, reference: &GitReference) {
        self.fetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.clone());
    }
}

fn cancellable_callbacks(cancel: &CancellationToken) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.transfer_progress(move |_| !cancel.is_cancelled());
    callbacks
}

fn open_repository(path: &Utf8Path) -> Result<Repository, GitOperationError> {
    Repository::open(path.as_std_path()).map_err(|error| GitOperationError::OpenRepository {
        path: path.to_owned(),
        error,
    })
}

fn prepare_directory(path: &Utf8Path) -> Result<(), GitOperationError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path()).map_err(|source| {
            GitOperationError::PrepareDirectory {
                path: parent.to_owned(),
                source,
            }
        })?;
    }
    Ok(())
}

#[derive(Debug)]
pub enum GitOperationError {
    PrepareDirectory {
        path: Utf8PathBuf,
        source: io::Error,
    },
    InitRepository {
        path: Utf8PathBuf,
        error: git2::Error,
    },
    OpenRepository {
        path: Utf8PathBuf,
        error: git2::Error,
    },
    CloneRepository {
        source: String,
        error: git2::Error,
    },
    FetchRepository {
        source: String,
        error: git2::Error,
    },
    ReadTags {
        source: String,
        error: git2::Error,
    },
    InvalidRevision {
        rev: String,
        error: git2::Error,
    },
    RevisionLookup {
        rev: String,
        error: git2::Error,
    },
    ReadFile {
        rev: String,
        path: String,
        error: git2::Error,
    },
    Checkout {
        rev: String,
        error: git2::Error,
    },
    Cancelled,
}

impl fmt::Display for GitOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitOperationError::PrepareDirectory { path, source } => {
                write!(f, "Failed to prepare directory {path}: {source}")
            }
            GitOperationError::InitRepository { path, error } => {
                write!(f, "Failed to create repository at {path}: {error}")
            }
            GitOperationError::OpenRepository { path, error } => {
                write!(f, "Failed to open repository at {path}: {error}")
            }
            GitOperationError::CloneRepository { source, error } => {
                write!(f, "Failed to clone repository {source}: {error}")
            }
            GitOperationError::FetchRepository { source, error } => {
                write!(f, "Failed to fetch updates for repository {source}: {error}")
            }
            GitOperationError::ReadTags { source, error } => {
                write!(f, "Failed to list tags of {source}: {error}")
            }
            GitOperationError::InvalidRevision { rev, error } => write!(
                f,
                "Revision '{rev}' is not a valid commit identifier: {error}"
            ),
            GitOperationError::RevisionLookup { rev, error } => {
                write!(
                    f,
                    "Revision '{rev}' was not found in the repository: {error}"
                )
            }
            GitOperationError::ReadFile { rev, path, error } => {
                write!(f, "Failed to read '{path}' at revision '{rev}': {error}")
            }
            GitOperationError::Checkout { rev, error } => {
                write!(f, "Failed to checkout revision '{rev}': {error}")
            }
            GitOperationError::Cancelled => write!(f, "Git operation was cancelled"),
        }
    }
}

impl std::error::Error for GitOperationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GitOperationError::PrepareDirectory { source, .. } => Some(source),
            GitOperationError::InitRepository { error, .. } => Some(error),
            GitOperationError::OpenRepository { error, .. } => Some(error),
            GitOperationError::CloneRepository { error, .. } => Some(error),
            GitOperationError::FetchRepository { error, .. } => Some(error),
            GitOperationError::ReadTags { error, .. } => Some(error),
            GitOperationError::InvalidRevision { error, .. } => Some(error),
            GitOperationError::RevisionLookup { error, .. } => Some(error),
            GitOperationError::ReadFile { error, .. } => Some(error),
            GitOperationError::Checkout { error, .. } => Some(error),
            GitOperationError::Cancelled => None,
        }
    }
}
