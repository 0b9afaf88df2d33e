use std::{
    fs::{self, File},
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use camino::{Utf8Path, Utf8PathBuf};
use common::resolved::ResolvedDependency;
use driver::{BuildError, BuildStatus, Builder};
use resolver::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs the configured build command with `sh -c` inside each checkout.
/// Output goes to `<build_dir>/<name>.log`.
pub struct ShellBuilder {
    command: Option<String>,
    build_dir: Utf8PathBuf,
}

impl ShellBuilder {
    pub fn new(command: Option<String>, build_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            command,
            build_dir: build_dir.into(),
        }
    }
}

impl Builder for ShellBuilder {
    fn build(
        &self,
        dependency: &ResolvedDependency,
        checkout: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<BuildStatus, BuildError> {
        let Some(command) = &self.command else {
            return Ok(BuildStatus::NothingToBuild(
                "no build command configured".to_string(),
            ));
        };
        let name = dependency.name.as_str();
        let failed = |reason: String| BuildError::new(name, reason);

        let output_dir = self.build_dir.join(name);
        fs::create_dir_all(&output_dir)
            .map_err(|error| failed(format!("cannot create {output_dir}: {error}")))?;
        let log_path = self.build_dir.join(format!("{name}.log"));
        let log = File::create(&log_path)
            .map_err(|error| failed(format!("cannot create {log_path}: {error}")))?;
        let log_err = log
            .try_clone()
            .map_err(|error| failed(format!("cannot open {log_path}: {error}")))?;

        tracing::debug!(target: "pipeline", "Running `{command}` in {checkout}");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(checkout)
            .env("STRAND_DEPENDENCY", name)
            .env("STRAND_VERSION", dependency.version().to_string())
            .env("STRAND_REVISION", dependency.revision())
            .env("STRAND_OUTPUT_DIR", &output_dir)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
            .map_err(|error| failed(format!("cannot run `{command}`: {error}")))?;

        loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(failed("cancelled".to_string()));
            }
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(BuildStatus::Built),
                Ok(Some(status)) => {
                    return Err(failed(format!(
                        "`{command}` exited with {status}, see {log_path}"
                    )));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(error) => return Err(failed(format!("waiting for `{command}`: {error}"))),
            }
        }
    }
}
