//! Project-level settings read from `strand.toml`.

use std::{env, fs, io, num::NonZeroUsize, thread};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;

pub const SETTINGS_FILE: &str = "strand.toml";
pub const CACHE_DIR_ENV: &str = "STRAND_CACHE_DIR";

const DEFAULT_MANIFEST_FILE: &str = "Strandfile";
const DEFAULT_RESOLVED_FILE: &str = "Strandfile.resolved";
const DEFAULT_FETCH_RETRIES: u32 = 2;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {error}")]
    Read { path: Utf8PathBuf, error: io::Error },
    #[error("failed to parse {path}: {error}")]
    Parse {
        path: Utf8PathBuf,
        error: toml::de::Error,
    },
}

/// Settings as written in the file; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct SettingsFile {
    checkouts_dir: Option<Utf8PathBuf>,
    build_dir: Option<Utf8PathBuf>,
    cache_dir: Option<Utf8PathBuf>,
    manifest_file: Option<String>,
    resolved_file: Option<String>,
    max_concurrency: Option<NonZeroUsize>,
    fetch_retries: Option<u32>,
    use_binaries: Option<bool>,
    use_ssh: Option<bool>,
    build_command: Option<String>,
}

/// Fully resolved settings with absolute directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub project_dir: Utf8PathBuf,
    pub checkouts_dir: Utf8PathBuf,
    pub build_dir: Utf8PathBuf,
    pub cache_dir: Utf8PathBuf,
    pub manifest_file: String,
    pub resolved_file: String,
    pub max_concurrency: usize,
    pub fetch_retries: u32,
    pub use_binaries: bool,
    /// Clone and fetch `http(s)` remotes over SSH.
    pub use_ssh: bool,
    /// Shell command run inside each checkout by `build`. Without one,
    /// dependencies are checked out but nothing is compiled.
    pub build_command: Option<String>,
}

impl Settings {
    /// Defaults for `project_dir` with no settings file.
    pub fn for_project(project_dir: impl Into<Utf8PathBuf>) -> Self {
        Self::from_file(project_dir.into(), SettingsFile::default())
    }

    /// Loads `strand.toml` from `project_dir` if present.
    pub fn load(project_dir: &Utf8Path) -> Result<Self, SettingsError> {
        let path = project_dir.join(SETTINGS_FILE);
        let file = match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|error| SettingsError::Parse { path, error })?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => SettingsFile::default(),
            Err(error) => return Err(SettingsError::Read { path, error }),
        };
        Ok(Self::from_file(project_dir.to_owned(), file))
    }

    fn from_file(project_dir: Utf8PathBuf, file: SettingsFile) -> Self {
        let root = project_dir.join("Strand");
        let absolute = |path: Utf8PathBuf| {
            if path.is_absolute() {
                path
            } else {
                project_dir.join(path)
            }
        };
        let cache_dir = env::var(CACHE_DIR_ENV)
            .ok()
            .filter(|value| !value.is_empty())
            .map(Utf8PathBuf::from)
            .or(file.cache_dir)
            .map(&absolute)
            .unwrap_or_else(|| root.join(".cache"));
        let max_concurrency = file
            .max_concurrency
            .or_else(|| thread::available_parallelism().ok())
            .map_or(1, NonZeroUsize::get);

        Self {
            checkouts_dir: file
                .checkouts_dir
                .map(&absolute)
                .unwrap_or_else(|| root.join("Checkouts")),
            build_dir: file
                .build_dir
                .map(&absolute)
                .unwrap_or_else(|| root.join("Build")),
            cache_dir,
            manifest_file: file
                .manifest_file
                .unwrap_or_else(|| DEFAULT_MANIFEST_FILE.to_string()),
            resolved_file: file
                .resolved_file
                .unwrap_or_else(|| DEFAULT_RESOLVED_FILE.to_string()),
            max_concurrency,
            fetch_retries: file.fetch_retries.unwrap_or(DEFAULT_FETCH_RETRIES),
            use_binaries: file.use_binaries.unwrap_or(true),
            use_ssh: file.use_ssh.unwrap_or(false),
            build_command: file.build_command.filter(|command| !command.trim().is_empty()),
            project_dir,
        }
    }

    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.project_dir.join(&self.manifest_file)
    }

    pub fn resolved_path(&self) -> Utf8PathBuf {
        self.project_dir.join(&self.resolved_file)
    }

    pub fn repositories_dir(&self) -> Utf8PathBuf {
        self.cache_dir.join("repositories")
    }

    pub fn build_cache_path(&self) -> Utf8PathBuf {
        self.build_dir.join("build-cache.toml")
    }
}
