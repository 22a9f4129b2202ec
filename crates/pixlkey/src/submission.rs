//! Client-supplied inputs for a run: descriptive fields, uploaded files,
//! watermark and licence choices, and request context.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::sanitize;

static DATE_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("date pattern compiles"));

/// Extensions accepted for a one-off watermark upload.
pub const WATERMARK_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Descriptive fields shared by every file in a run. Keys match the
/// persisted `data.json` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFields {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub seo_headline: String,
    #[serde(default)]
    pub creation_date: String,
    #[serde(default)]
    pub byline_name: String,
    #[serde(default)]
    pub copyright_notice: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub position: String,
    #[serde(default, rename = "webstatement")]
    pub web_statement: String,
    /// Comma-separated.
    #[serde(default)]
    pub keywords: String,
    /// Comma-separated.
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub overlay_text: String,
}

impl MetadataFields {
    /// Trims surrounding whitespace from every field.
    pub fn trimmed(mut self) -> Self {
        for field in [
            &mut self.title,
            &mut self.description,
            &mut self.seo_headline,
            &mut self.creation_date,
            &mut self.byline_name,
            &mut self.copyright_notice,
            &mut self.creator,
            &mut self.position,
            &mut self.web_statement,
            &mut self.keywords,
            &mut self.genre,
            &mut self.overlay_text,
        ] {
            let trimmed = field.trim();
            if trimmed.len() != field.len() {
                *field = trimmed.to_string();
            }
        }
        self
    }

    /// Checks the fields a run cannot start without and returns the parsed
    /// creation date.
    pub fn validate(&self) -> Result<NaiveDate, ValidationError> {
        parse_creation_date(&self.creation_date)
    }

    pub fn keyword_list(&self) -> Vec<String> {
        split_list(&self.keywords)
    }

    pub fn genre_list(&self) -> Vec<String> {
        split_list(&self.genre)
    }

    pub fn creator_list(&self) -> Vec<String> {
        split_list(&self.creator)
    }

    pub fn byline_list(&self) -> Vec<String> {
        split_list(&self.byline_name)
    }
}

/// Parses a `YYYY-MM-DD` creation date, rejecting both malformed strings
/// and impossible dates such as `2024-02-30`.
pub fn parse_creation_date(raw: &str) -> Result<NaiveDate, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::MissingField("creation_date"));
    }
    if !DATE_SHAPE.is_match(raw) {
        return Err(ValidationError::MalformedDate(raw.to_string()));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ValidationError::InvalidDate(raw.to_string()))
}

/// Splits a comma-separated list, trimming entries and dropping empties.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// One uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub original_name: String,
    pub bytes: Vec<u8>,
    pub declared_extension: String,
}

impl Upload {
    pub fn new(original_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let original_name = original_name.into();
        let declared_extension = sanitize::extension_of(&original_name);
        Self {
            original_name,
            bytes,
            declared_extension,
        }
    }

    /// Reads a local file as an upload, using its file name as the original name.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        Ok(Self::new(name, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Watermark sources for a run. A one-off upload always wins over the
/// saved selection.
#[derive(Debug, Clone, Default)]
pub struct WatermarkChoice {
    pub uploaded: Option<Upload>,
    pub saved: Option<PathBuf>,
}

/// The watermark a run will actually composite.
#[derive(Debug, Clone)]
pub enum ResolvedWatermark {
    Uploaded(Upload),
    Saved(PathBuf),
}

impl WatermarkChoice {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn saved(path: impl Into<PathBuf>) -> Self {
        Self {
            uploaded: None,
            saved: Some(path.into()),
        }
    }

    pub fn uploaded(upload: Upload) -> Self {
        Self {
            uploaded: Some(upload),
            saved: None,
        }
    }

    pub fn resolve(self) -> Result<Option<ResolvedWatermark>, ValidationError> {
        if let Some(upload) = self.uploaded {
            if !WATERMARK_EXTENSIONS.contains(&upload.declared_extension.as_str()) {
                return Err(ValidationError::UnsupportedWatermark(upload.original_name));
            }
            return Ok(Some(ResolvedWatermark::Uploaded(upload)));
        }
        Ok(self.saved.map(ResolvedWatermark::Saved))
    }
}

/// Resolves the licence text for a run, falling back to the configured
/// default when none was selected or the selection is blank.
pub fn resolve_licence(selected: Option<&str>, default_licence: &str) -> String {
    selected
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default_licence)
        .to_string()
}

/// Request context recorded alongside a run as `submission.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionContext {
    pub client_ip: String,
    #[serde(default)]
    pub user_agent: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub referral_source: Option<String>,
    #[serde(default)]
    pub additional_data: Option<serde_json::Value>,
}

impl SubmissionContext {
    pub fn new(client_ip: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            user_agent: String::new(),
            submitted_at: Utc::now(),
            referral_source: None,
            additional_data: None,
        }
    }
}
