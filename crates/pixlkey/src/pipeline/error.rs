use std::time::Duration;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::error::{ArchiveError, ValidationError, WorkspaceError};
use crate::toolkit::ToolkitError;

/// Failure of one stage for one file. The file is dropped from the run;
/// the run continues with the remaining files.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("{0}")]
    Toolkit(#[from] ToolkitError),

    #[error("{0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Failed to access '{path}': {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported file extension '{0}'")]
    UnsupportedExtension(String),

    #[error("Embedding metadata did not change the file fingerprint")]
    FingerprintUnchanged,

    #[error("Embedded identifier missing after metadata round-trip")]
    MetadataMismatch,
}

impl StageError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StageError::Toolkit(ToolkitError::TimedOut { .. }))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Toolkit(ToolkitError::Cancelled { .. }))
    }
}

/// Failure of the run as a whole.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid submission: {0}")]
    Validation(#[from] ValidationError),

    #[error("Too many attempts; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Workspace unavailable: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Run registry update failed: {0}")]
    Registry(#[from] DatabaseError),

    #[error("Archive build failed: {0}")]
    Archive(#[from] ArchiveError),

    #[error("No files completed processing")]
    NoCompletedFiles,

    #[error("Run cancelled")]
    Cancelled,
}
