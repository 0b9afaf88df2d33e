use std::{collections::BTreeMap, fs};

use camino::{Utf8Path, Utf8PathBuf};
use common::resolved::ResolvedDependency;
use driver::{BinaryDefinition, BinaryFetchError, BinaryFetcher, BinaryRelease};
use resolver::CancellationToken;
use url::Url;

/// Fetches prebuilt binaries published on the local filesystem.
///
/// A definition is a TOML table mapping versions to archive URLs:
///
/// ```toml
/// "1.2.0" = "file:///releases/json-1.2.0.zip"
/// ```
///
/// Installing copies the archive into `<install_dir>/<name>/`.
pub struct LocalBinaryFetcher {
    install_dir: Utf8PathBuf,
}

impl LocalBinaryFetcher {
    pub fn new(install_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
        }
    }
}

fn local_path(url: &Url) -> Result<Utf8PathBuf, BinaryFetchError> {
    if url.scheme() != "file" {
        return Err(BinaryFetchError::new(
            url,
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }
    url.to_file_path()
        .ok()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
        .ok_or_else(|| BinaryFetchError::new(url, "not a local file path"))
}

impl BinaryFetcher for LocalBinaryFetcher {
    fn definition(&self, url: &Url) -> Result<BinaryDefinition, BinaryFetchError> {
        let path = local_path(url)?;
        let content = fs::read_to_string(&path)
            .map_err(|error| BinaryFetchError::new(url, error.to_string()))?;
        let releases: BTreeMap<String, Url> = toml::from_str(&content)
            .map_err(|error| BinaryFetchError::new(url, error.message().to_string()))?;
        Ok(BinaryDefinition::from_pairs(
            releases
                .iter()
                .map(|(version, url)| (version.as_str(), url.clone())),
        ))
    }

    fn download(
        &self,
        _dependency: &ResolvedDependency,
        release: &BinaryRelease,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, BinaryFetchError> {
        if cancel.is_cancelled() {
            return Err(BinaryFetchError::new(&release.url, "cancelled"));
        }
        let path = local_path(&release.url)?;
        if !path.is_file() {
            return Err(BinaryFetchError::new(&release.url, "archive does not exist"));
        }
        Ok(path)
    }

    fn install(
        &self,
        dependency: &ResolvedDependency,
        release: &BinaryRelease,
        archive: &Utf8Path,
    ) -> Result<(), BinaryFetchError> {
        let file_name = archive
            .file_name()
            .ok_or_else(|| BinaryFetchError::new(&release.url, "archive has no file name"))?;
        let destination = self.install_dir.join(dependency.name.as_str());
        fs::create_dir_all(&destination)
            .and_then(|()| fs::copy(archive, destination.join(file_name)))
            .map_err(|error| {
                BinaryFetchError::new(
                    &release.url,
                    format!("cannot install into {destination}: {error}"),
                )
            })?;
        tracing::debug!(target: "pipeline", "Installed {archive} into {destination}");
        Ok(())
    }
}
