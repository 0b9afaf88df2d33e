use std::{fmt, sync::mpsc};

use smol_str::SmolStr;
use url::Url;

/// A lifecycle step of one dependency's trip through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectEventKind {
    Cloning,
    Fetching,
    CheckingOut { revision: String },
    DownloadingBinaryDefinition { url: Url },
    DownloadingBinary { release: String },
    SkippedDownloadingBinary { reason: String },
    SkippedInstallingBinary { error: String },
    SkippedBuilding { reason: String },
    SkippedBuildingCached,
    RebuildingCached,
    BuildingUncached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectEvent {
    pub dependency: SmolStr,
    pub kind: ProjectEventKind,
}

impl ProjectEvent {
    pub fn new(dependency: impl Into<SmolStr>, kind: ProjectEventKind) -> Self {
        Self {
            dependency: dependency.into(),
            kind,
        }
    }
}

impl fmt::Display for ProjectEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = &self.dependency;
        match &self.kind {
            ProjectEventKind::Cloning => write!(f, "Cloning {name}"),
            ProjectEventKind::Fetching => write!(f, "Fetching {name}"),
            ProjectEventKind::CheckingOut { revision } => {
                write!(f, "Checking out {name} at \"{revision}\"")
            }
            ProjectEventKind::DownloadingBinaryDefinition { url } => {
                write!(f, "Downloading binary definition of {name} from {url}")
            }
            ProjectEventKind::DownloadingBinary { release } => {
                write!(f, "Downloading {name} binary at \"{release}\"")
            }
            ProjectEventKind::SkippedDownloadingBinary { reason } => {
                write!(f, "Skipped downloading {name} binary: {reason}")
            }
            ProjectEventKind::SkippedInstallingBinary { error } => {
                write!(f, "Skipped installing {name} binary: {error}")
            }
            ProjectEventKind::SkippedBuilding { reason } => {
                write!(f, "Skipped building {name}: {reason}")
            }
            ProjectEventKind::SkippedBuildingCached => {
                write!(f, "Valid cache found for {name}, skipping build")
            }
            ProjectEventKind::RebuildingCached => write!(
                f,
                "Invalid cache found for {name}, rebuilding with all downstream dependencies"
            ),
            ProjectEventKind::BuildingUncached => write!(
                f,
                "No cache found for {name}, building with all downstream dependencies"
            ),
        }
    }
}

/// Receives lifecycle events. Events are observational: a sink can never
/// slow down or fail the pipeline.
pub trait EventSink: Send + Sync {
    fn put(&self, event: ProjectEvent);
}

/// Pushes events onto a channel drained elsewhere. A dropped receiver is
/// ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<ProjectEvent>,
}

impl EventSink for ChannelSink {
    fn put(&self, event: ProjectEvent) {
        let _ = self.sender.send(event);
    }
}

/// A sink plus the receiving end it feeds, for a single consumer that
/// renders events in arrival order.
pub fn event_channel() -> (ChannelSink, mpsc::Receiver<ProjectEvent>) {
    let (sender, receiver) = mpsc::channel();
    (ChannelSink { sender }, receiver)
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn put(&self, _event: ProjectEvent) {}
}
