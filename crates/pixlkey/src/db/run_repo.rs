//! Run registry over the `processing_runs` table.
//!
//! A run is registered before any file is processed, so an owner-scoped
//! lookup is possible for the whole life of the run. `zip_path` stays NULL
//! until an archive exists.

use std::fmt;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "processing" => Some(RunStatus::Processing),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub owner_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub zip_path: Option<String>,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let status: String = row.get("status")?;
        Ok(Self {
            run_id: row.get("run_id")?,
            owner_id: row.get("owner_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            zip_path: row.get("zip_path")?,
            status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
            error: row.get("error")?,
        })
    }
}

/// Registers a new run in the `processing` state with no archive.
pub fn register(db: &Database, run_id: &str, owner_id: &str) -> Result<(), DatabaseError> {
    let now = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO processing_runs (run_id, owner_id, created_at, updated_at, zip_path, status)
             VALUES (?1, ?2, ?3, ?3, NULL, ?4)",
            params![run_id, owner_id, now, RunStatus::Processing.as_str()],
        )?;
        Ok(())
    })
}

/// Records the finished archive and marks the run completed.
pub fn record_archive(db: &Database, run_id: &str, zip_path: &str) -> Result<(), DatabaseError> {
    let now = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE processing_runs SET zip_path = ?1, status = ?2, updated_at = ?3
             WHERE run_id = ?4",
            params![zip_path, RunStatus::Completed.as_str(), now, run_id],
        )?;
        if updated == 0 {
            return Err(DatabaseError::Sqlite(rusqlite::Error::QueryReturnedNoRows));
        }
        Ok(())
    })
}

/// Marks a run failed. The archive path is left NULL.
pub fn mark_failed(db: &Database, run_id: &str, error: &str) -> Result<(), DatabaseError> {
    let now = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE processing_runs SET status = ?1, error = ?2, updated_at = ?3
             WHERE run_id = ?4",
            params![RunStatus::Failed.as_str(), error, now, run_id],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, run_id: &str) -> Result<Option<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM processing_runs WHERE run_id = ?1",
                params![run_id],
                RunRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Looks a run up by id, scoped to its owner. Another owner's run is
/// indistinguishable from a missing one.
pub fn find_owned(
    db: &Database,
    run_id: &str,
    owner_id: &str,
) -> Result<Option<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM processing_runs WHERE run_id = ?1 AND owner_id = ?2",
                params![run_id, owner_id],
                RunRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}
