pub mod admission;
pub mod archive;
pub mod committer;
pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod pipeline;
pub mod sanitize;
pub mod submission;
pub mod toolkit;
pub mod workspace;

pub use admission::{AdmissionGate, MemoryRateLimiter, RateLimitPolicy, RateLimitStore};
pub use committer::{CommitError, CommitReceipt, CommitState, FileArtifacts, PersistenceCommitter};
pub use config::{load_config, Config};
pub use db::Database;
pub use download::{ArchiveDownload, DownloadError, DownloadService};
pub use error::{
    ArchiveError, ConfigError, PixlkeyError, Result, ValidationError, WorkspaceError,
};
pub use pipeline::{Pipeline, PipelineConfig, PipelineError, RunRequest, RunResult};
pub use submission::{MetadataFields, SubmissionContext, Upload, WatermarkChoice};
pub use toolkit::{ImageToolkit, MemoryToolkit, StandardToolkit};
pub use workspace::{RunId, WorkspaceManager};
