use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PixlkeyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Commit error: {0}")]
    Commit(#[from] crate::committer::CommitError),

    #[error("Download error: {0}")]
    Download(#[from] crate::download::DownloadError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

/// Rejections raised before a run touches the filesystem or the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Creation date '{0}' must use the YYYY-MM-DD format")]
    MalformedDate(String),

    #[error("Creation date '{0}' is not a calendar date")]
    InvalidDate(String),

    #[error("No files were submitted")]
    NoFiles,

    #[error("File '{name}' is {size} bytes, exceeding the {limit} byte limit")]
    FileTooLarge { name: String, size: u64, limit: u64 },

    #[error("Watermark '{0}' must be a PNG, JPEG or WebP image")]
    UnsupportedWatermark(String),
}

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Failed to create owner directory '{path}': {source}")]
    CreateOwnerDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create run directory '{path}': {source}")]
    CreateRunDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse '{path}': {source}")]
    ParseDocument {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to remove run directory '{path}': {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Run directory not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to create archive '{path}': {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to add '{path}' to archive: {source}")]
    AddEntry {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to finalize archive '{path}': {source}")]
    Finalize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive output missing: {0}")]
    MissingEntry(PathBuf),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("No completed files to archive")]
    Empty,
}

pub type Result<T> = std::result::Result<T, PixlkeyError>;
