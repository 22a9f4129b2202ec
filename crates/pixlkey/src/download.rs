//! Owner-scoped archive retrieval over the run registry.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::admission::{Admission, AdmissionGate};
use crate::db::run_repo::{self, RunStatus};
use crate::db::{Database, DatabaseError};
use crate::sanitize;
use crate::workspace::RunId;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Invalid run id: {0}")]
    InvalidRunId(String),

    #[error("Archive not found")]
    NotFound,

    #[error("Too many downloads; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Failed to read archive '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Database(#[from] DatabaseError),
}

impl DownloadError {
    /// HTTP status an outer surface should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            DownloadError::InvalidRunId(_) => 400,
            DownloadError::NotFound => 404,
            DownloadError::RateLimited { .. } => 429,
            DownloadError::Io { .. } | DownloadError::Database(_) => 500,
        }
    }

    /// Seconds for a `Retry-After` header, when applicable.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            DownloadError::RateLimited { retry_after } => Some(retry_after.as_secs().max(1)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDownload {
    /// Attachment file name: the archive's own name.
    pub filename: String,
    pub content_length: u64,
    pub bytes: Vec<u8>,
}

impl ArchiveDownload {
    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.filename)
    }
}

pub struct DownloadService {
    db: Database,
    gate: Option<AdmissionGate>,
}

impl DownloadService {
    pub fn new(db: Database) -> Self {
        Self { db, gate: None }
    }

    pub fn with_admission(mut self, gate: AdmissionGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Returns the archive of `raw_run_id` if `owner_id` owns the run and
    /// the run completed. Runs owned by someone else are reported exactly
    /// like missing ones.
    pub fn fetch(
        &self,
        owner_id: &str,
        raw_run_id: &str,
        actor: &str,
    ) -> Result<ArchiveDownload, DownloadError> {
        let run_id =
            RunId::parse(raw_run_id).map_err(|_| DownloadError::InvalidRunId(raw_run_id.to_string()))?;

        if let Some(gate) = &self.gate {
            if let Admission::Denied { retry_after } = gate.enter(actor) {
                return Err(DownloadError::RateLimited { retry_after });
            }
        }

        let Some(run) = run_repo::find_owned(&self.db, run_id.as_str(), owner_id)? else {
            debug!(run_id = %run_id, "Download denied: run not owned or missing");
            return Err(DownloadError::NotFound);
        };
        if run.status != RunStatus::Completed {
            return Err(DownloadError::NotFound);
        }
        let Some(zip_path) = run.zip_path.map(PathBuf::from) else {
            return Err(DownloadError::NotFound);
        };

        read_archive(&zip_path)
    }
}

fn read_archive(path: &Path) -> Result<ArchiveDownload, DownloadError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Registered archive is gone: {}", sanitize::redact_path(path));
            return Err(DownloadError::NotFound);
        }
        Err(e) => {
            return Err(DownloadError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    Ok(ArchiveDownload {
        filename: sanitize::redact_path(path),
        content_length: bytes.len() as u64,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{MemoryRateLimiter, RateLimitPolicy, DOWNLOAD_ACTION};
    use std::sync::Arc;
    use tempfile::TempDir;

    const RUN: &str = "6f9619ff-8b86-4011-b42d-00c04fc964ff";

    fn setup() -> (TempDir, Database, PathBuf) {
        let temp = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let zip = temp.path().join("final_assets.zip");
        fs::write(&zip, b"PK\x05\x06zipbytes").unwrap();
        run_repo::register(&db, RUN, "owner-a").unwrap();
        run_repo::record_archive(&db, RUN, &zip.to_string_lossy()).unwrap();
        (temp, db, zip)
    }

    #[test]
    fn test_owner_gets_archive() {
        let (_temp, db, _zip) = setup();
        let download = DownloadService::new(db).fetch("owner-a", RUN, "1.2.3.4").unwrap();
        assert_eq!(download.filename, "final_assets.zip");
        assert_eq!(download.content_length, 12);
        assert_eq!(download.bytes.len(), 12);
        assert_eq!(
            download.content_disposition(),
            "attachment; filename=\"final_assets.zip\""
        );
    }

    #[test]
    fn test_other_owner_denied_even_if_archive_exists() {
        let (_temp, db, zip) = setup();
        assert!(zip.exists());
        let err = DownloadService::new(db).fetch("owner-b", RUN, "1.2.3.4").unwrap_err();
        assert!(matches!(err, DownloadError::NotFound));
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_malformed_run_id_rejected() {
        let (_temp, db, _zip) = setup();
        let service = DownloadService::new(db);
        for raw in ["../etc", "6F9619FF-8B86-4011-B42D-00C04FC964FF", ""] {
            let err = service.fetch("owner-a", raw, "1.2.3.4").unwrap_err();
            assert_eq!(err.status_code(), 400, "{}", raw);
        }
    }

    #[test]
    fn test_failed_run_has_no_archive() {
        let (_temp, db, _zip) = setup();
        run_repo::mark_failed(&db, RUN, "boom").unwrap();
        let err = DownloadService::new(db).fetch("owner-a", RUN, "1.2.3.4").unwrap_err();
        assert!(matches!(err, DownloadError::NotFound));
    }

    #[test]
    fn test_deleted_archive_is_not_found() {
        let (_temp, db, zip) = setup();
        fs::remove_file(&zip).unwrap();
        let err = DownloadService::new(db).fetch("owner-a", RUN, "1.2.3.4").unwrap_err();
        assert!(matches!(err, DownloadError::NotFound));
    }

    #[test]
    fn test_rate_limited_with_retry_hint() {
        let (_temp, db, _zip) = setup();
        let gate = AdmissionGate::new(
            Arc::new(MemoryRateLimiter::new(Duration::from_secs(60))),
            RateLimitPolicy::new(1, Duration::from_secs(30)),
            DOWNLOAD_ACTION,
        );
        let service = DownloadService::new(db).with_admission(gate);

        service.fetch("owner-a", RUN, "1.2.3.4").unwrap();
        let err = service.fetch("owner-a", RUN, "1.2.3.4").unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert!(err.retry_after_secs().unwrap() >= 1);
    }
}
