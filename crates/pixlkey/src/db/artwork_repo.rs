//! Artwork records and the rows hanging off them: image variants,
//! certificates, AI metadata and submission context.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

pub const STATUS_PROCESSED: &str = "Processed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtworkRow {
    pub artwork_id: String,
    pub run_id: String,
    pub owner_id: String,
    pub title: String,
    pub description: String,
    pub seo_headline: String,
    pub creation_date: String,
    pub byline: String,
    pub copyright_notice: String,
    pub creator: String,
    pub position: String,
    pub web_statement: String,
    pub overlay_text: String,
    pub fingerprint: Option<String>,
    pub status: String,
    /// Day the certificate of authenticity was issued, `YYYY-MM-DD`.
    pub issue_date: String,
    pub created_at: String,
}

impl ArtworkRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            artwork_id: row.get("artwork_id")?,
            run_id: row.get("run_id")?,
            owner_id: row.get("owner_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            seo_headline: row.get("seo_headline")?,
            creation_date: row.get("creation_date")?,
            byline: row.get("byline")?,
            copyright_notice: row.get("copyright_notice")?,
            creator: row.get("creator")?,
            position: row.get("position")?,
            web_statement: row.get("web_statement")?,
            overlay_text: row.get("overlay_text")?,
            fingerprint: row.get("fingerprint")?,
            status: row.get("status")?,
            issue_date: row.get("issue_date")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageVariantRow {
    pub image_id: String,
    pub artwork_id: String,
    pub variant_kind: String,
    pub path: String,
    pub size: i64,
    pub width: u32,
    pub height: u32,
    pub mime: String,
    pub fingerprint: String,
}

impl ImageVariantRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            image_id: row.get("image_id")?,
            artwork_id: row.get("artwork_id")?,
            variant_kind: row.get("variant_kind")?,
            path: row.get("path")?,
            size: row.get("size")?,
            width: row.get("width")?,
            height: row.get("height")?,
            mime: row.get("mime")?,
            fingerprint: row.get("fingerprint")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRow {
    pub certificate_id: String,
    pub artwork_id: String,
    pub rendered_text: String,
    pub path: String,
    pub issued_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRow {
    pub submission_id: String,
    pub artwork_id: String,
    pub client_ip: String,
    pub user_agent: String,
    pub submitted_at: String,
    pub referral_source: Option<String>,
    pub additional_data: Option<String>,
}

pub fn insert_artwork(conn: &Connection, artwork: &ArtworkRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO artworks (artwork_id, run_id, owner_id, title, description, seo_headline,
         creation_date, byline, copyright_notice, creator, position, web_statement,
         overlay_text, fingerprint, status, issue_date, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            artwork.artwork_id,
            artwork.run_id,
            artwork.owner_id,
            artwork.title,
            artwork.description,
            artwork.seo_headline,
            artwork.creation_date,
            artwork.byline,
            artwork.copyright_notice,
            artwork.creator,
            artwork.position,
            artwork.web_statement,
            artwork.overlay_text,
            artwork.fingerprint,
            artwork.status,
            artwork.issue_date,
            artwork.created_at,
        ],
    )?;
    Ok(())
}

pub fn insert_variant(conn: &Connection, variant: &ImageVariantRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO image_variants (image_id, artwork_id, variant_kind, path, size, width,
         height, mime, fingerprint)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            variant.image_id,
            variant.artwork_id,
            variant.variant_kind,
            variant.path,
            variant.size,
            variant.width,
            variant.height,
            variant.mime,
            variant.fingerprint,
        ],
    )?;
    Ok(())
}

pub fn insert_certificate(
    conn: &Connection,
    certificate: &CertificateRow,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO certificates (certificate_id, artwork_id, rendered_text, path, issued_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            certificate.certificate_id,
            certificate.artwork_id,
            certificate.rendered_text,
            certificate.path,
            certificate.issued_at,
        ],
    )?;
    Ok(())
}

pub fn insert_ai_metadata(
    conn: &Connection,
    ai_metadata_id: &str,
    artwork_id: &str,
    metadata: &str,
    generated_at: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO ai_metadata (ai_metadata_id, artwork_id, metadata, generated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![ai_metadata_id, artwork_id, metadata, generated_at],
    )?;
    Ok(())
}

pub fn insert_submission(
    conn: &Connection,
    submission: &SubmissionRow,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO submissions (submission_id, artwork_id, client_ip, user_agent,
         submitted_at, referral_source, additional_data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            submission.submission_id,
            submission.artwork_id,
            submission.client_ip,
            submission.user_agent,
            submission.submitted_at,
            submission.referral_source,
            submission.additional_data,
        ],
    )?;
    Ok(())
}

/// Artworks are immutable apart from status transitions.
pub fn update_status(db: &Database, artwork_id: &str, status: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE artworks SET status = ?1 WHERE artwork_id = ?2",
            params![status, artwork_id],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, artwork_id: &str) -> Result<Option<ArtworkRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM artworks WHERE artwork_id = ?1",
                params![artwork_id],
                ArtworkRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn find_by_run(db: &Database, run_id: &str) -> Result<Vec<ArtworkRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM artworks WHERE run_id = ?1 ORDER BY created_at")?;
        let rows = stmt
            .query_map(params![run_id], ArtworkRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn variants_for_artwork(
    db: &Database,
    artwork_id: &str,
) -> Result<Vec<ImageVariantRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM image_variants WHERE artwork_id = ?1 ORDER BY path",
        )?;
        let rows = stmt
            .query_map(params![artwork_id], ImageVariantRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Row count of one of the artwork-side tables.
pub fn count_rows(db: &Database, table: &str) -> Result<u32, DatabaseError> {
    const TABLES: &[&str] = &[
        "artworks",
        "image_variants",
        "certificates",
        "ai_metadata",
        "submissions",
    ];
    if !TABLES.contains(&table) {
        return Err(DatabaseError::CorruptRow {
            table: "artworks",
            reason: format!("unknown table '{}'", table),
        });
    }
    db.with_conn(|conn| {
        let n = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
        Ok(n)
    })
}
