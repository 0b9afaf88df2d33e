//! Terminal rendering of lifecycle events and pipeline reports.

use colored::Colorize;
use common::resolved::ResolvedGraph;
use driver::{Completion, PipelineReport, ProjectEvent, ProjectEventKind};

pub fn event_line(event: &ProjectEvent) -> String {
    let line = format!("*** {event}");
    match event.kind {
        ProjectEventKind::SkippedDownloadingBinary { .. }
        | ProjectEventKind::SkippedInstallingBinary { .. }
        | ProjectEventKind::SkippedBuilding { .. } => line.yellow().to_string(),
        _ => line,
    }
}

fn completion_label(completion: Completion) -> &'static str {
    match completion {
        Completion::CheckedOut => "checked out",
        Completion::SkippedCached => "up to date",
        Completion::Built => "built",
        Completion::Rebuilt => "rebuilt",
        Completion::NothingToBuild => "nothing to build",
        Completion::InstalledBinary => "installed binary",
    }
}

/// One line per dependency, failures last.
pub fn report_lines(report: &PipelineReport) -> Vec<String> {
    let mut lines: Vec<String> = report
        .successes()
        .map(|(name, completion)| {
            format!("{} {name}: {}", "ok".green(), completion_label(completion))
        })
        .collect();
    lines.extend(
        report
            .failures()
            .map(|(name, failure)| format!("{} {name}: {failure}", "FAILED".red())),
    );
    lines
}

pub fn resolved_lines(graph: &ResolvedGraph) -> Vec<String> {
    graph
        .iter()
        .map(|dependency| {
            format!(
                "{} {} ({})",
                dependency.name.bold(),
                dependency.pinned.tag,
                dependency.reference.raw()
            )
        })
        .collect()
}
