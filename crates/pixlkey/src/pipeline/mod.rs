pub mod certificate;
pub mod config;
pub mod context;
pub mod error;
pub mod progress;
pub mod provenance;
pub mod runner;

pub use config::PipelineConfig;
pub use context::{RunRequest, RunResult, SkippedFile, StageOutput};
pub use error::{PipelineError, StageError};
pub use progress::{
    BroadcastProgress, ChannelProgress, EventLevel, NoopProgress, ProgressEvent,
    ProgressReporter, RecordingProgress, RunProgressBroadcaster, RunProgressEvent, Stage,
};
pub use runner::Pipeline;
