//! Data model shared by the strand resolver and checkout pipeline.
//!
//! Dependencies are identified by [`GitReference`], whose equality is
//! defined over a normalized form of the remote address so that different
//! spellings of the same remote collapse into one identity.

pub mod dependencies;
pub mod git_url;
pub mod manifest;
pub mod resolved;
pub mod settings;
pub mod version;

pub use git_url::GitReference;
pub use manifest::{InvalidName, Manifest, ManifestEntry, ManifestParser};
pub use version::{InvalidConstraint, PinnedVersion, Version, VersionConstraint};
