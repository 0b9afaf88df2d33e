#![allow(clippy::print_stderr, clippy::print_stdout)]
mod binaries;
mod manifest;
mod output;
mod shell;

use std::{
    io::{self, IsTerminal},
    process::ExitCode,
    thread,
};

use binaries::LocalBinaryFetcher;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use common::settings::{Settings, SettingsError};
use driver::{CommandError, PipelineReport, Project, event_channel};
use manifest::TomlManifestParser;
use shell::ShellBuilder;
use smol_str::SmolStr;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Options {
    /// Show resolver and pipeline progress.
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// When to color output.
    #[arg(long, global = true, value_enum, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,
    /// Clone and fetch `http(s)` remotes over SSH.
    #[arg(long, global = true)]
    pub use_ssh: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Resolve the manifest and write the resolved file.
    Resolve {
        #[arg(long, default_value_t = default_project_path())]
        path: Utf8PathBuf,
        /// Ignore existing pins and pick the newest satisfying versions.
        #[arg(long)]
        update: bool,
    },
    /// Check out every dependency at its pinned revision.
    Checkout {
        #[arg(long, default_value_t = default_project_path())]
        path: Utf8PathBuf,
        /// Only these dependencies and what they require.
        dependencies: Vec<String>,
    },
    /// Check out and build dependencies, reusing valid cached builds.
    Build {
        #[arg(long, default_value_t = default_project_path())]
        path: Utf8PathBuf,
        /// Only these dependencies and what they require.
        dependencies: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    fn apply(self) {
        match self {
            ColorChoice::Always => colored::control::set_override(true),
            ColorChoice::Never => colored::control::set_override(false),
            ColorChoice::Auto if !io::stdout().is_terminal() => {
                colored::control::set_override(false)
            }
            ColorChoice::Auto => colored::control::unset_override(),
        }
    }
}

fn default_project_path() -> Utf8PathBuf {
    Utf8PathBuf::from(".")
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "warn,resolver=info,pipeline=info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let opts = Options::parse();
    opts.color.apply();
    init_logging(opts.verbose);
    match run(&opts) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{} {err}", "Error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

/// Settings of the project at `path`, with command-line overrides applied.
fn load_settings(path: &Utf8Path, opts: &Options) -> Result<Settings, CliError> {
    let mut settings = Settings::load(path)?;
    settings.use_ssh |= opts.use_ssh;
    Ok(settings)
}

fn run(opts: &Options) -> Result<bool, CliError> {
    match &opts.command {
        Command::Resolve { path, update } => {
            let settings = load_settings(path, opts)?;
            let project = Project::new(&settings, &TomlManifestParser);
            let git = project.git();
            let resolved = project.resolve(&git, *update)?;
            project.save_resolved(&resolved)?;
            for line in output::resolved_lines(&resolved) {
                println!("{line}");
            }
            Ok(true)
        }
        Command::Checkout { path, dependencies } => {
            let settings = load_settings(path, opts)?;
            let project = Project::new(&settings, &TomlManifestParser);
            let only = names(dependencies);
            let report = with_event_printer(|sink| project.checkout(&only, sink))?;
            Ok(summarize(&report))
        }
        Command::Build { path, dependencies } => {
            let settings = load_settings(path, opts)?;
            let project = Project::new(&settings, &TomlManifestParser);
            let only = names(dependencies);
            let builder =
                ShellBuilder::new(settings.build_command.clone(), settings.build_dir.clone());
            let binaries = LocalBinaryFetcher::new(settings.build_dir.join("Binaries"));
            let report =
                with_event_printer(|sink| project.build(&only, sink, &builder, &binaries))?;
            Ok(summarize(&report))
        }
    }
}

fn names(dependencies: &[String]) -> Vec<SmolStr> {
    dependencies.iter().map(SmolStr::new).collect()
}

/// Runs `command` while a second thread prints its events in arrival order.
fn with_event_printer<T>(
    command: impl FnOnce(&dyn driver::EventSink) -> Result<T, CommandError>,
) -> Result<T, CommandError> {
    let (sink, receiver) = event_channel();
    thread::scope(|scope| {
        scope.spawn(move || {
            for event in receiver {
                println!("{}", output::event_line(&event));
            }
        });
        let result = command(&sink);
        drop(sink);
        result
    })
}

fn summarize(report: &PipelineReport) -> bool {
    for line in output::report_lines(report) {
        println!("{line}");
    }
    report.is_success()
}
