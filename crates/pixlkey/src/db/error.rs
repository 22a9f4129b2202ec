//! Errors raised by the run registry and the artwork store.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The parent directory of the database file could not be created.
    #[error("Failed to prepare database directory '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema migration {version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored value (status, timestamp) does not parse back.
    #[error("Unreadable row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },

    #[error("Database handle poisoned by a panicking thread")]
    LockPoisoned,
}
