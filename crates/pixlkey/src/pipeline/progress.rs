use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Admission,
    Register,
    Workspace,
    StoreUpload,
    StripMetadata,
    NormalizeFormat,
    Watermark,
    FingerprintPreEmbed,
    EmbedMetadata,
    FingerprintPostEmbed,
    Derivatives,
    WatermarkDerivatives,
    ExtractMetadata,
    Certificate,
    Archive,
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Validate => "validate",
            Stage::Admission => "admission",
            Stage::Register => "register",
            Stage::Workspace => "workspace",
            Stage::StoreUpload => "store_upload",
            Stage::StripMetadata => "strip_metadata",
            Stage::NormalizeFormat => "normalize_format",
            Stage::Watermark => "watermark",
            Stage::FingerprintPreEmbed => "fingerprint_pre_embed",
            Stage::EmbedMetadata => "embed_metadata",
            Stage::FingerprintPostEmbed => "fingerprint_post_embed",
            Stage::Derivatives => "derivatives",
            Stage::WatermarkDerivatives => "watermark_derivatives",
            Stage::ExtractMetadata => "extract_metadata",
            Stage::Certificate => "certificate",
            Stage::Archive => "archive",
            Stage::Finalize => "finalize",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Client-facing run events. Paths inside messages are already redacted
/// to the `.../processed/...` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    Step {
        stage: Stage,
        level: EventLevel,
        file: Option<String>,
        message: String,
    },
    FileSkipped {
        file: String,
        stage: Stage,
        reason: String,
    },
    Completed {
        run_id: String,
        archive_name: String,
        files: usize,
    },
    Failed {
        stage: Stage,
        error: String,
    },
}

impl ProgressEvent {
    pub fn info(stage: Stage, file: Option<&str>, message: impl Into<String>) -> Self {
        Self::step(stage, EventLevel::Info, file, message)
    }

    pub fn success(stage: Stage, file: Option<&str>, message: impl Into<String>) -> Self {
        Self::step(stage, EventLevel::Success, file, message)
    }

    pub fn warning(stage: Stage, file: Option<&str>, message: impl Into<String>) -> Self {
        Self::step(stage, EventLevel::Warning, file, message)
    }

    fn step(stage: Stage, level: EventLevel, file: Option<&str>, message: impl Into<String>) -> Self {
        ProgressEvent::Step {
            stage,
            level,
            file: file.map(str::to_string),
            message: message.into(),
        }
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards events over a crossbeam channel; used by the CLI to print
/// events while the run executes.
pub struct ChannelProgress {
    sender: crossbeam_channel::Sender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, crossbeam_channel::Receiver<ProgressEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}

/// A progress event stamped for broadcast subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunProgressEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

/// Fan-out of run events to any number of subscribers (e.g. a streaming
/// HTTP response per client).
#[derive(Clone)]
pub struct RunProgressBroadcaster {
    sender: Arc<broadcast::Sender<RunProgressEvent>>,
}

impl RunProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Send errors just mean there are no subscribers right now.
    pub fn send(&self, event: ProgressEvent) {
        let _ = self.sender.send(RunProgressEvent {
            timestamp: Utc::now(),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunProgressEvent> {
        self.sender.subscribe()
    }

    pub fn reporter(&self) -> BroadcastProgress {
        BroadcastProgress {
            broadcaster: self.clone(),
        }
    }
}

impl Default for RunProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

pub struct BroadcastProgress {
    broadcaster: RunProgressBroadcaster,
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: ProgressEvent) {
        self.broadcaster.send(event);
    }
}

/// Collects every event in memory. Handy for tests and for summarising a
/// run after the fact.
#[derive(Default)]
pub struct RecordingProgress {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
