use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

use smol_str::SmolStr;
use url::Url;

/// Placeholder substituted for `NUL` before the raw address is split into
/// path segments (SYMBOL FOR NULL).
const NUL_PLACEHOLDER: char = '\u{2400}';

/// Stand-in for `.` in names made only of dots (FULLWIDTH FULL STOP).
const FULL_STOP_PLACEHOLDER: char = '\u{FF0E}';

/// The address of a Git remote as written in a manifest.
///
/// Equality, ordering and hashing use the normalized address, which drops
/// protocol, credentials, port and a trailing `.git`. The raw spelling is kept
/// for display and for the actual Git operations.
#[derive(Clone)]
pub struct GitReference {
    raw: String,
    normalized: String,
}

impl GitReference {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let normalized = normalize(&raw);
        Self { raw, normalized }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// The repository name inferred from the last path segment, if any.
    pub fn name(&self) -> Option<SmolStr> {
        name(&self.raw)
    }

    /// The scp-style SSH address of an `http(s)` remote, e.g.
    /// `git@github.com:org/repo.git` for `https://github.com/org/repo.git`.
    /// Other spellings are already SSH, git-protocol or local and yield `None`.
    pub fn ssh_url(&self) -> Option<String> {
        let url = Url::parse(&self.raw).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        let host = url.host_str()?;
        let path = url.path().trim_start_matches('/');
        if path.is_empty() {
            return None;
        }
        Some(format!("git@{host}:{path}"))
    }

    /// True when the reference points at a directory on this machine rather
    /// than a network remote.
    pub fn is_local_path(&self) -> bool {
        Url::parse(&self.raw).is_err() && is_local_path_spelling(&self.raw)
    }
}

/// Canonical, comparable form of a remote address. Never fails.
pub fn normalize(raw: &str) -> String {
    if let Ok(url) = Url::parse(raw)
        && let Some(host) = url.host_str()
    {
        return format!("{host}{}", strip_git_suffix(url.path()));
    }

    if is_local_path_spelling(raw) {
        return strip_git_suffix(raw).to_string();
    }

    // scp syntax: [user@]host:path
    let stripped = match raw.find('@') {
        Some(index) => &raw[index + 1..],
        None => raw,
    };
    let (host, path) = match stripped.find(':') {
        Some(index) => (&stripped[..index], &stripped[index + 1..]),
        None => ("", stripped),
    };
    let path = strip_git_suffix(path);
    if path.starts_with('/') {
        format!("{host}{path}")
    } else {
        format!("{host}/{path}")
    }
}

/// Repository name derived from the last non-empty `/`-separated segment.
///
/// A segment made only of `.` characters is rewritten with look-alike
/// characters so it can never act as `.` or `..` in a filesystem path.
pub fn name(raw: &str) -> Option<SmolStr> {
    let sanitized = raw.replace('\0', &NUL_PLACEHOLDER.to_string());
    let last = sanitized
        .split('/')
        .filter(|segment| !segment.is_empty())
        .next_back()?;
    let last = strip_git_suffix(last);
    if last.is_empty() {
        return None;
    }
    if last.chars().all(|c| c == '.') {
        let replaced: String = last.chars().map(|_| FULL_STOP_PLACEHOLDER).collect();
        return Some(SmolStr::new(replaced));
    }
    Some(SmolStr::new(last))
}

fn is_local_path_spelling(raw: &str) -> bool {
    raw.starts_with('/') || raw.starts_with('.') || raw.starts_with('~') || !raw.contains(':')
}

fn strip_git_suffix(path: &str) -> &str {
    path.strip_suffix(".git").unwrap_or(path)
}

impl PartialEq for GitReference {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for GitReference {}

impl Hash for GitReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl PartialOrd for GitReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GitReference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl fmt::Display for GitReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for GitReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GitReference({:?} => {:?})", self.raw, self.normalized)
    }
}

impl From<&str> for GitReference {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}
