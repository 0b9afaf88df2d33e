#![cfg(not(target_arch = "wasm32"))]

use std::{fs, path::Path, process::Command};

use camino::Utf8PathBuf;
use common::{
    GitReference, Manifest, ManifestEntry, ManifestParser, PinnedVersion, Version,
    VersionConstraint, resolved::ResolvedDependency,
};
use strand_resolver::{
    CancellationToken, DependencySource, Resolver, checkout::CheckoutBackend, git::GitResolver,
    source::GitDependencySource,
};
use tempfile::{TempDir, tempdir};

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

fn run_git(repo_dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_dir)
        .args(args)
        .output()
        .expect("failed to run git command");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// One remote per line, every requirement unconstrained.
struct LineParser;

impl ManifestParser for LineParser {
    fn parse(&self, content: &str) -> Result<Manifest, String> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                if line.contains(' ') {
                    Err(format!("unexpected whitespace in '{line}'"))
                } else {
                    Ok(ManifestEntry::new(
                        GitReference::new(line),
                        VersionConstraint::Any,
                    ))
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Manifest::new)
    }
}

struct Remote {
    dir: TempDir,
}

impl Remote {
    fn new(name: &str) -> Self {
        let dir = tempfile::Builder::new()
            .prefix(name)
            .tempdir()
            .expect("failed to create remote dir");
        run_git(dir.path(), &["init"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        run_git(dir.path(), &["config", "user.name", "Test User"]);
        Self { dir }
    }

    fn reference(&self) -> GitReference {
        GitReference::new(self.dir.path().to_string_lossy())
    }

    fn commit(&self, file: &str, content: &str) -> String {
        fs::write(self.dir.path().join(file), content).expect("failed to write file");
        run_git(self.dir.path(), &["add", "."]);
        run_git(self.dir.path(), &["commit", "-m", file]);
        run_git(self.dir.path(), &["rev-parse", "HEAD"])
    }

    fn tag(&self, tag: &str) {
        run_git(self.dir.path(), &["tag", tag]);
    }
}

fn resolver_in(root: &TempDir) -> GitResolver {
    let root = Utf8PathBuf::from_path_buf(root.path().to_path_buf())
        .expect("temp dir is not valid utf-8");
    GitResolver::new(root.join("Checkouts"), root.join("repositories"))
}

#[test]
fn version_tags_become_pinned_versions() {
    if !git_available() {
        return;
    }
    let remote = Remote::new("json");
    let first = remote.commit("README", "one\n");
    remote.tag("v1.0");
    remote.tag("release-candidate");
    let second = remote.commit("README", "two\n");
    remote.tag("1.2.0");

    let root = tempdir().unwrap();
    let git = resolver_in(&root);
    let mut versions = git
        .available_versions(&remote.reference(), &CancellationToken::new())
        .unwrap();
    versions.sort_by(|a, b| a.version.cmp(&b.version));
    assert_eq!(
        versions,
        vec![
            PinnedVersion::new(Version::new(1, 0, 0), "v1.0", first),
            PinnedVersion::new(Version::new(1, 2, 0), "1.2.0", second),
        ]
    );
    assert!(git.mirror_path(&remote.reference()).exists());
}

#[test]
fn nested_manifests_are_read_from_tagged_revisions() {
    if !git_available() {
        return;
    }
    let json = Remote::new("json");
    json.commit("README", "json\n");
    json.tag("v2.0.0");

    let kit = Remote::new("kit");
    kit.commit("README", "no manifest yet\n");
    kit.tag("v0.9.0");
    kit.commit("Strandfile", &format!("{}\n", json.dir.path().display()));
    kit.tag("v1.0.0");

    let root = tempdir().unwrap();
    let git = resolver_in(&root);
    let mut source = GitDependencySource::new(&git, LineParser, "Strandfile");

    let versions = source.versions(&kit.reference()).unwrap();
    let old = versions
        .iter()
        .find(|pinned| pinned.version == Version::new(0, 9, 0))
        .unwrap();
    assert!(source.manifest(&kit.reference(), old).unwrap().is_empty());

    let root_manifest = Manifest::new(vec![ManifestEntry::new(
        kit.reference(),
        VersionConstraint::Any,
    )]);
    let graph = Resolver::new(source).resolve(&root_manifest).unwrap();
    assert_eq!(graph.len(), 2);
    assert_eq!(
        graph.get(&json.reference()).unwrap().version(),
        &Version::new(2, 0, 0)
    );
    assert_eq!(
        graph.get(&kit.reference()).unwrap().dependencies,
        vec![json.reference()]
    );
}

#[test]
fn malformed_nested_manifest_is_a_read_error() {
    if !git_available() {
        return;
    }
    let kit = Remote::new("kit");
    kit.commit("Strandfile", "not a remote\n");
    kit.tag("v1.0.0");

    let root = tempdir().unwrap();
    let git = resolver_in(&root);
    let mut source = GitDependencySource::new(&git, LineParser, "Strandfile");
    let pinned = source.versions(&kit.reference()).unwrap().remove(0);
    let error = source.manifest(&kit.reference(), &pinned).unwrap_err();
    assert_eq!(error.revision, pinned.revision);
    assert!(error.reason.contains("unexpected whitespace"));
}

#[test]
fn checkout_materializes_pinned_revision() {
    if !git_available() {
        return;
    }
    let remote = Remote::new("kit");
    let first = remote.commit("README", "one\n");
    remote.tag("v1.0.0");
    let second = remote.commit("README", "two\n");
    remote.tag("v2.0.0");

    let root = tempdir().unwrap();
    let git = resolver_in(&root);
    let cancel = CancellationToken::new();
    let mut dependency = ResolvedDependency {
        name: "kit".into(),
        reference: remote.reference(),
        pinned: PinnedVersion::new(Version::new(1, 0, 0), "v1.0.0", first.clone()),
        dependencies: vec![],
        binary: None,
    };

    assert!(!CheckoutBackend::has_checkout(&git, &dependency));
    git.clone_dependency(&dependency, &cancel).unwrap();
    assert!(CheckoutBackend::has_checkout(&git, &dependency));
    let path = git.checkout_dependency(&dependency, &cancel).unwrap();
    assert_eq!(fs::read_to_string(path.join("README")).unwrap(), "one\n");
    assert_eq!(git.checked_out_revision("kit"), Some(first));

    // Already present revisions need no transfer.
    dependency.pinned = PinnedVersion::new(Version::new(2, 0, 0), "v2.0.0", second.clone());
    assert!(!git.fetch_dependency(&dependency, &cancel).unwrap());
    let path = git.checkout_dependency(&dependency, &cancel).unwrap();
    assert_eq!(fs::read_to_string(path.join("README")).unwrap(), "two\n");

    // Checking out the same revision again is a no-op on the tree.
    let again = git.checkout_dependency(&dependency, &cancel).unwrap();
    assert_eq!(again, path);
    assert_eq!(git.checked_out_revision("kit"), Some(second));
}

#[test]
fn fetch_picks_up_new_remote_commits() {
    if !git_available() {
        return;
    }
    let remote = Remote::new("kit");
    let first = remote.commit("README", "one\n");
    remote.tag("v1.0.0");

    let root = tempdir().unwrap();
    let git = resolver_in(&root);
    let cancel = CancellationToken::new();
    let mut dependency = ResolvedDependency {
        name: "kit".into(),
        reference: remote.reference(),
        pinned: PinnedVersion::new(Version::new(1, 0, 0), "v1.0.0", first),
        dependencies: vec![],
        binary: None,
    };
    git.clone_dependency(&dependency, &cancel).unwrap();

    let second = remote.commit("README", "two\n");
    remote.tag("v1.1.0");
    dependency.pinned = PinnedVersion::new(Version::new(1, 1, 0), "v1.1.0", second);
    assert!(git.fetch_dependency(&dependency, &cancel).unwrap());
    let path = git.checkout_dependency(&dependency, &cancel).unwrap();
    assert_eq!(fs::read_to_string(path.join("README")).unwrap(), "two\n");
}

#[test]
fn cancelled_fetch_fails_fast() {
    if !git_available() {
        return;
    }
    let remote = Remote::new("kit");
    remote.commit("README", "one\n");
    remote.tag("v1.0.0");

    let root = tempdir().unwrap();
    let git = resolver_in(&root);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = git
        .available_versions(&remote.reference(), &cancel)
        .unwrap_err();
    assert!(matches!(
        error,
        strand_resolver::git::GitOperationError::Cancelled
    ));
}

#[test]
fn ssh_preference_rewrites_only_https_remotes() {
    let root = tempdir().unwrap();
    let git = resolver_in(&root).with_ssh(true);
    let https = GitReference::new("https://github.com/acme/json.git");
    assert_eq!(git.remote_url(&https), "git@github.com:acme/json.git");
    let scp = GitReference::new("git@github.com:acme/json");
    assert_eq!(git.remote_url(&scp), "git@github.com:acme/json");
    assert_eq!(
        resolver_in(&root).remote_url(&https),
        "https://github.com/acme/json.git"
    );
    assert_eq!(
        git.mirror_path(&https),
        git.mirror_path(&scp),
        "mirrors stay keyed by identity"
    );

    if !git_available() {
        return;
    }
    let remote = Remote::new("kit");
    remote.commit("README", "one\n");
    remote.tag("v1.0.0");
    let versions = git
        .available_versions(&remote.reference(), &CancellationToken::new())
        .unwrap();
    assert_eq!(versions.len(), 1);
}
