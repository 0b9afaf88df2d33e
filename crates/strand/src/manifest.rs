//! The `Strandfile` format: a TOML list of git dependencies.
//!
//! ```toml
//! [[dependency]]
//! git = "https://github.com/acme/json.git"
//! version = "~> 2.1"
//! binary = "file:///opt/binaries/json.toml"
//! ```

use common::{GitReference, Manifest, ManifestEntry, ManifestParser, VersionConstraint};
use serde::Deserialize;
use url::Url;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFile {
    #[serde(default, rename = "dependency")]
    dependencies: Vec<DependencyEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyEntry {
    git: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    binary: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TomlManifestParser;

impl ManifestParser for TomlManifestParser {
    fn parse(&self, content: &str) -> Result<Manifest, String> {
        let file: ManifestFile = toml::from_str(content).map_err(|error| error.to_string())?;
        file.dependencies
            .into_iter()
            .map(|entry| {
                let constraint: VersionConstraint = entry
                    .version
                    .as_deref()
                    .unwrap_or_default()
                    .parse()
                    .map_err(|error| format!("{}: {error}", entry.git))?;
                let reference = GitReference::new(entry.git.as_str());
                let mut manifest_entry = ManifestEntry::new(reference, constraint);
                if let Some(name) = entry.name {
                    manifest_entry = manifest_entry
                        .with_name(name)
                        .map_err(|error| error.to_string())?;
                } else if manifest_entry.reference.name().is_none() {
                    return Err(format!("cannot derive a name from '{}'", entry.git));
                }
                if let Some(binary) = entry.binary {
                    let url = Url::parse(&binary)
                        .map_err(|error| format!("invalid binary url '{binary}': {error}"))?;
                    manifest_entry = manifest_entry.with_binary(url);
                }
                Ok(manifest_entry)
            })
            .collect::<Result<Vec<_>, String>>()
            .map(Manifest::new)
    }
}
