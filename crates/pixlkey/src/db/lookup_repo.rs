//! Natural-key lookup tables (keywords, genres, creators, bylines) and
//! their artwork join tables.
//!
//! Functions take a plain `&Connection` so they compose inside a
//! transaction opened by the caller.

use rusqlite::{params, Connection};
use uuid::Uuid;

use super::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Keyword,
    Genre,
    Creator,
    Byline,
}

impl LookupKind {
    pub const ALL: [LookupKind; 4] = [
        LookupKind::Keyword,
        LookupKind::Genre,
        LookupKind::Creator,
        LookupKind::Byline,
    ];

    fn table(&self) -> &'static str {
        match self {
            LookupKind::Keyword => "keywords",
            LookupKind::Genre => "genres",
            LookupKind::Creator => "creators",
            LookupKind::Byline => "bylines",
        }
    }

    fn id_column(&self) -> &'static str {
        match self {
            LookupKind::Keyword => "keyword_id",
            LookupKind::Genre => "genre_id",
            LookupKind::Creator => "creator_id",
            LookupKind::Byline => "byline_id",
        }
    }

    fn value_column(&self) -> &'static str {
        match self {
            LookupKind::Keyword => "keyword",
            LookupKind::Genre => "genre",
            LookupKind::Creator | LookupKind::Byline => "name",
        }
    }

    fn join_table(&self) -> &'static str {
        match self {
            LookupKind::Keyword => "artwork_keywords",
            LookupKind::Genre => "artwork_genres",
            LookupKind::Creator => "artwork_creators",
            LookupKind::Byline => "artwork_bylines",
        }
    }
}

/// Returns the id for `value`, inserting a new row only when the value is
/// not already present. Calling it twice yields the same id.
pub fn get_or_create(
    conn: &Connection,
    kind: LookupKind,
    value: &str,
) -> Result<String, DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO {} ({}, {}) VALUES (?1, ?2) ON CONFLICT({}) DO NOTHING",
            kind.table(),
            kind.id_column(),
            kind.value_column(),
            kind.value_column()
        ),
        params![Uuid::new_v4().to_string(), value],
    )?;
    let id = conn.query_row(
        &format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            kind.id_column(),
            kind.table(),
            kind.value_column()
        ),
        params![value],
        |r| r.get(0),
    )?;
    Ok(id)
}

/// Links an artwork to a lookup row. Returns `false` when the link already
/// existed.
pub fn link(
    conn: &Connection,
    kind: LookupKind,
    artwork_id: &str,
    lookup_id: &str,
) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {} (artwork_id, {}) VALUES (?1, ?2)",
            kind.join_table(),
            kind.id_column()
        ),
        params![artwork_id, lookup_id],
    )?;
    Ok(inserted > 0)
}

/// Resolves every value and links it to the artwork. Duplicate values are
/// harmless no-ops.
pub fn attach_all(
    conn: &Connection,
    kind: LookupKind,
    artwork_id: &str,
    values: &[String],
) -> Result<usize, DatabaseError> {
    let mut linked = 0;
    for value in values {
        let id = get_or_create(conn, kind, value)?;
        if link(conn, kind, artwork_id, &id)? {
            linked += 1;
        }
    }
    Ok(linked)
}

pub fn count(conn: &Connection, kind: LookupKind) -> Result<u32, DatabaseError> {
    let n = conn.query_row(&format!("SELECT COUNT(*) FROM {}", kind.table()), [], |r| {
        r.get(0)
    })?;
    Ok(n)
}

pub fn count_links(conn: &Connection, kind: LookupKind) -> Result<u32, DatabaseError> {
    let n = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", kind.join_table()),
        [],
        |r| r.get(0),
    )?;
    Ok(n)
}

/// Values linked to one artwork, sorted.
pub fn values_for_artwork(
    conn: &Connection,
    kind: LookupKind,
    artwork_id: &str,
) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT l.{value} FROM {table} l JOIN {join} j ON j.{id} = l.{id}
         WHERE j.artwork_id = ?1 ORDER BY l.{value}",
        value = kind.value_column(),
        table = kind.table(),
        join = kind.join_table(),
        id = kind.id_column(),
    ))?;
    let rows = stmt
        .query_map(params![artwork_id], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}
