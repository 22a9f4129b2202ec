//! Schema versioning for the run registry and artwork tables.
//!
//! Versions are recorded in `_migrations`; anything above the highest
//! recorded version is applied in order.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_processing_runs_table",
        sql: include_str!("sql/001_create_processing_runs.sql"),
    },
    Migration {
        version: 2,
        description: "create_artworks_and_lookup_tables",
        sql: include_str!("sql/002_create_artworks.sql"),
    },
    Migration {
        version: 3,
        description: "create_artifact_tables",
        sql: include_str!("sql/003_create_artifacts.sql"),
    },
];

const TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

/// Brings the schema up to the latest version. Each migration is applied
/// and recorded in its own transaction.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(TRACKING_TABLE)?;

    let applied: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        log::debug!("Schema is current at v{}", applied);
        return Ok(());
    }

    for migration in pending {
        apply(conn, migration)?;
    }
    Ok(())
}

fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let failed = |e: rusqlite::Error| DatabaseError::Migration {
        version: migration.version,
        reason: e.to_string(),
    };

    log::info!(
        "Applying schema v{}: {}",
        migration.version,
        migration.description
    );
    let tx = conn.unchecked_transaction().map_err(failed)?;
    tx.execute_batch(migration.sql).map_err(failed)?;
    tx.execute(
        "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
        rusqlite::params![migration.version, migration.description],
    )
    .map_err(failed)?;
    tx.commit().map_err(failed)
}
