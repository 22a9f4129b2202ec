use std::path::{Path, PathBuf};

use crate::fingerprint::Fingerprint;
use crate::submission::{MetadataFields, SubmissionContext, Upload, WatermarkChoice};
use crate::toolkit::CancelToken;
use crate::workspace::{FileLayout, RunId};

use super::progress::Stage;

/// Everything a run needs from the caller.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub owner_id: String,
    pub files: Vec<Upload>,
    pub watermark: WatermarkChoice,
    pub licence: Option<String>,
    pub fields: MetadataFields,
    pub submission: Option<SubmissionContext>,
    pub cancel: CancelToken,
}

impl RunRequest {
    pub fn new(owner_id: impl Into<String>, files: Vec<Upload>, fields: MetadataFields) -> Self {
        Self {
            owner_id: owner_id.into(),
            files,
            watermark: WatermarkChoice::none(),
            licence: None,
            fields,
            submission: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_watermark(mut self, watermark: WatermarkChoice) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn with_licence(mut self, licence: impl Into<String>) -> Self {
        self.licence = Some(licence.into());
        self
    }

    pub fn with_submission(mut self, submission: SubmissionContext) -> Self {
        self.submission = Some(submission);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Identity used for rate limiting: the client address when known,
    /// otherwise the owner.
    pub fn actor(&self) -> &str {
        self.submission
            .as_ref()
            .map(|s| s.client_ip.as_str())
            .filter(|ip| !ip.is_empty())
            .unwrap_or(&self.owner_id)
    }
}

/// Per-file state threaded through the stages.
#[derive(Debug)]
pub struct FileContext {
    pub original_name: String,
    pub layout: FileLayout,
}

impl FileContext {
    pub fn new(original_name: &str, layout: FileLayout) -> Self {
        Self {
            original_name: original_name.to_string(),
            layout,
        }
    }
}

/// The five artifacts of one completed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    pub original_name: String,
    /// Sanitized, run-unique base name every artifact path starts with.
    pub basename: String,
    pub signed_image_path: PathBuf,
    pub thumbnail_path: PathBuf,
    pub preview_path: PathBuf,
    pub metadata_document_path: PathBuf,
    pub certificate_path: PathBuf,
    pub pre_embed_fingerprint: Fingerprint,
    pub post_embed_fingerprint: Fingerprint,
    pub embedded: bool,
}

impl StageOutput {
    pub fn files(&self) -> [&Path; 5] {
        [
            self.signed_image_path.as_path(),
            self.thumbnail_path.as_path(),
            self.preview_path.as_path(),
            self.metadata_document_path.as_path(),
            self.certificate_path.as_path(),
        ]
    }
}

/// A file dropped from the run and the stage that dropped it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub original_name: String,
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: RunId,
    pub archive_path: PathBuf,
    pub archive_name: String,
    pub outputs: Vec<StageOutput>,
    pub skipped: Vec<SkippedFile>,
}
