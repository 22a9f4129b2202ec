//! Persistence committer: turns one finished run's on-disk artifacts into
//! a normalized record set, all inside a single transaction.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::db::artwork_repo::{
    self, ArtworkRow, CertificateRow, ImageVariantRow, SubmissionRow, STATUS_PROCESSED,
};
use crate::db::lookup_repo::{self, LookupKind};
use crate::db::run_repo::{self, RunStatus};
use crate::db::{Database, DatabaseError};
use crate::error::{ValidationError, WorkspaceError};
use crate::fingerprint::fingerprint_file;
use crate::submission::{MetadataFields, SubmissionContext};
use crate::toolkit::{CancelToken, Deadline, ImageToolkit, ToolkitError};
use crate::workspace::{FileLayout, RunId, RunWorkspace, WorkspaceManager};

pub const SIGNED_VARIANT: &str = "signed";

/// Lifecycle of one commit. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Idle,
    Validating,
    Transacting,
    Committed,
    RolledBack,
}

impl CommitState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    pub const fn can_transition_to(self, next: CommitState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Validating)
                | (Self::Validating, Self::Transacting)
                | (Self::Validating, Self::RolledBack)
                | (Self::Transacting, Self::Committed)
                | (Self::Transacting, Self::RolledBack)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Transacting => "transacting",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }
}

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("Run {0} belongs to another owner")]
    Forbidden(String),

    #[error("Run {0} not found")]
    NotFound(String),

    #[error("Run data is incomplete: {0}")]
    InvalidRunData(String),

    #[error("Invalid run metadata: {0}")]
    Validation(#[from] ValidationError),

    #[error("Commit rolled back: {0}")]
    RolledBack(String),

    #[error("{0}")]
    Database(#[from] DatabaseError),

    #[error("{0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Failed to inspect '{path}': {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: ToolkitError,
    },
}

/// The files one completed input contributes to a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileArtifacts {
    pub signed_image: PathBuf,
    pub metadata_document: PathBuf,
    pub certificate: PathBuf,
    pub ai_metadata: Option<PathBuf>,
}

impl FileArtifacts {
    /// Artifacts at the conventional locations; the AI side document is
    /// included only when present.
    pub fn from_layout(layout: &FileLayout) -> Self {
        Self {
            signed_image: layout.signed.clone(),
            metadata_document: layout.metadata_document.clone(),
            certificate: layout.certificate.clone(),
            ai_metadata: layout
                .ai_metadata
                .is_file()
                .then(|| layout.ai_metadata.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub artwork_id: String,
    pub variants: usize,
    pub state: CommitState,
}

/// Everything read from disk before the transaction opens.
struct PreparedCommit {
    artwork: ArtworkRow,
    lookups: Vec<(LookupKind, Vec<String>)>,
    files: Vec<PreparedFile>,
    submission: Option<SubmissionRow>,
}

struct PreparedFile {
    variant: ImageVariantRow,
    certificate: CertificateRow,
    ai_metadata: Option<String>,
}

struct Tracker {
    state: CommitState,
}

impl Tracker {
    fn new() -> Self {
        Self {
            state: CommitState::Idle,
        }
    }

    fn advance(&mut self, next: CommitState) {
        if self.state.can_transition_to(next) {
            debug!("Commit state {} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
        } else {
            warn!(
                "Ignoring commit transition {} -> {}",
                self.state.as_str(),
                next.as_str()
            );
        }
    }
}

pub struct PersistenceCommitter {
    db: Database,
    workspaces: WorkspaceManager,
    toolkit: Arc<dyn ImageToolkit>,
    inspect_timeout: Duration,
}

impl PersistenceCommitter {
    pub fn new(
        db: Database,
        workspaces: WorkspaceManager,
        toolkit: Arc<dyn ImageToolkit>,
        inspect_timeout: Duration,
    ) -> Self {
        Self {
            db,
            workspaces,
            toolkit,
            inspect_timeout,
        }
    }

    /// Commits a run from what its workspace holds: `data.json` for the
    /// fields and the completed files listed in `files.json`.
    pub fn commit_from_workspace(
        &self,
        run_id: &RunId,
        owner_id: &str,
    ) -> Result<CommitReceipt, CommitError> {
        let workspace = self.authorize(run_id, owner_id)?;
        let fields: MetadataFields = workspace
            .read_json(&workspace.data_document_path())?
            .ok_or_else(|| CommitError::InvalidRunData("data.json is missing".to_string()))?;
        let files: Vec<FileArtifacts> = workspace
            .completed_layouts()?
            .ok_or_else(|| CommitError::InvalidRunData("files.json is missing".to_string()))?
            .iter()
            .map(FileArtifacts::from_layout)
            .collect();
        self.commit(run_id, owner_id, &fields, &files)
    }

    /// Inserts the artwork, its lookup links, one image variant and one
    /// certificate per file, optional AI metadata rows and the optional
    /// submission record. Nothing is written unless everything is.
    pub fn commit(
        &self,
        run_id: &RunId,
        owner_id: &str,
        fields: &MetadataFields,
        files: &[FileArtifacts],
    ) -> Result<CommitReceipt, CommitError> {
        let _span = info_span!("commit", run_id = %run_id, owner_id = %owner_id).entered();
        let mut tracker = Tracker::new();
        tracker.advance(CommitState::Validating);

        let prepared = self
            .authorize(run_id, owner_id)
            .and_then(|workspace| self.prepare(&workspace, run_id, fields, files));
        let PreparedCommit {
            artwork,
            lookups,
            files: prepared_files,
            submission,
        } = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                tracker.advance(CommitState::RolledBack);
                return Err(e);
            }
        };

        tracker.advance(CommitState::Transacting);
        let artwork_id = artwork.artwork_id.clone();
        let result = self.db.with_transaction(|tx| -> Result<(), DatabaseError> {
            artwork_repo::insert_artwork(tx, &artwork)?;
            for (kind, values) in &lookups {
                lookup_repo::attach_all(tx, *kind, &artwork_id, values)?;
            }
            for file in &prepared_files {
                artwork_repo::insert_variant(tx, &file.variant)?;
                artwork_repo::insert_certificate(tx, &file.certificate)?;
                if let Some(metadata) = &file.ai_metadata {
                    artwork_repo::insert_ai_metadata(
                        tx,
                        &Uuid::new_v4().to_string(),
                        &artwork_id,
                        metadata,
                        &artwork.created_at,
                    )?;
                }
            }
            if let Some(submission) = &submission {
                artwork_repo::insert_submission(tx, submission)?;
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                tracker.advance(CommitState::Committed);
                info!(
                    artwork_id = %artwork_id,
                    variants = prepared_files.len(),
                    "Run committed"
                );
                Ok(CommitReceipt {
                    artwork_id,
                    variants: prepared_files.len(),
                    state: tracker.state,
                })
            }
            Err(e) => {
                tracker.advance(CommitState::RolledBack);
                warn!("Commit rolled back: {}", e);
                Err(CommitError::RolledBack(e.to_string()))
            }
        }
    }

    /// The run must be registered to `owner_id`, completed, and still have
    /// its workspace on disk.
    fn authorize(&self, run_id: &RunId, owner_id: &str) -> Result<RunWorkspace, CommitError> {
        let Some(run) = run_repo::find_by_id(&self.db, run_id.as_str())? else {
            return Err(CommitError::NotFound(run_id.to_string()));
        };
        if run.owner_id != owner_id {
            return Err(CommitError::Forbidden(run_id.to_string()));
        }
        if run.status != RunStatus::Completed {
            return Err(CommitError::InvalidRunData(format!(
                "run is {}, not completed",
                run.status
            )));
        }
        if !artwork_repo::find_by_run(&self.db, run_id.as_str())?.is_empty() {
            return Err(CommitError::InvalidRunData(
                "run has already been committed".to_string(),
            ));
        }
        self.workspaces
            .locate(owner_id, run_id)
            .map_err(|e| match e {
                WorkspaceError::NotFound(_) => CommitError::NotFound(run_id.to_string()),
                other => CommitError::Workspace(other),
            })
    }

    fn prepare(
        &self,
        workspace: &RunWorkspace,
        run_id: &RunId,
        fields: &MetadataFields,
        files: &[FileArtifacts],
    ) -> Result<PreparedCommit, CommitError> {
        let fields = fields.clone().trimmed();
        fields.validate()?;
        if files.is_empty() {
            return Err(CommitError::InvalidRunData(
                "no signed images in run".to_string(),
            ));
        }

        let artwork_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let created_at = now.to_rfc3339();

        let prepared_files = files
            .iter()
            .map(|file| self.prepare_file(file, &artwork_id, &created_at))
            .collect::<Result<Vec<_>, _>>()?;

        let artwork = ArtworkRow {
            artwork_id: artwork_id.clone(),
            run_id: run_id.to_string(),
            owner_id: workspace.owner_id().to_string(),
            title: fields.title.clone(),
            description: fields.description.clone(),
            seo_headline: fields.seo_headline.clone(),
            creation_date: fields.creation_date.clone(),
            byline: fields.byline_name.clone(),
            copyright_notice: fields.copyright_notice.clone(),
            creator: fields.creator.clone(),
            position: fields.position.clone(),
            web_statement: fields.web_statement.clone(),
            overlay_text: fields.overlay_text.clone(),
            fingerprint: prepared_files.first().map(|f| f.variant.fingerprint.clone()),
            status: STATUS_PROCESSED.to_string(),
            issue_date: now.format("%Y-%m-%d").to_string(),
            created_at,
        };

        let lookups = LookupKind::ALL
            .iter()
            .map(|kind| (*kind, lookup_values(&fields, *kind)))
            .collect();

        let submission = self.load_submission(workspace, &artwork_id);
        Ok(PreparedCommit {
            artwork,
            lookups,
            files: prepared_files,
            submission,
        })
    }

    /// Reads size, dimensions and type from the produced file itself.
    fn prepare_file(
        &self,
        file: &FileArtifacts,
        artwork_id: &str,
        issued_at: &str,
    ) -> Result<PreparedFile, CommitError> {
        for required in [&file.signed_image, &file.metadata_document, &file.certificate] {
            if !required.is_file() {
                return Err(CommitError::InvalidRunData(format!(
                    "missing {}",
                    crate::sanitize::redact_path(required)
                )));
            }
        }

        let deadline = Deadline::after(self.inspect_timeout, CancelToken::new());
        let info = self
            .toolkit
            .measure(&file.signed_image, &deadline)
            .map_err(|e| CommitError::Inspect {
                path: file.signed_image.clone(),
                source: e,
            })?;
        let fingerprint = fingerprint_file(&file.signed_image).map_err(|e| {
            CommitError::Inspect {
                path: file.signed_image.clone(),
                source: ToolkitError::io(&file.signed_image, e),
            }
        })?;
        let certificate_text = read_text(&file.certificate)?;

        let variant = ImageVariantRow {
            image_id: Uuid::new_v4().to_string(),
            artwork_id: artwork_id.to_string(),
            variant_kind: SIGNED_VARIANT.to_string(),
            path: file.signed_image.to_string_lossy().into_owned(),
            size: info.size as i64,
            width: info.dimensions.width,
            height: info.dimensions.height,
            mime: info.mime,
            fingerprint: fingerprint.to_string(),
        };
        let certificate = CertificateRow {
            certificate_id: Uuid::new_v4().to_string(),
            artwork_id: artwork_id.to_string(),
            rendered_text: certificate_text,
            path: file.certificate.to_string_lossy().into_owned(),
            issued_at: issued_at.to_string(),
        };
        let ai_metadata = match &file.ai_metadata {
            Some(path) => Some(normalize_ai_metadata(&read_text(path)?)),
            None => None,
        };

        Ok(PreparedFile {
            variant,
            certificate,
            ai_metadata,
        })
    }

    /// A missing or unreadable `submission.json` only drops the record.
    fn load_submission(&self, workspace: &RunWorkspace, artwork_id: &str) -> Option<SubmissionRow> {
        let context: SubmissionContext =
            match workspace.read_json(&workspace.submission_document_path()) {
                Ok(context) => context?,
                Err(e) => {
                    warn!("Ignoring submission document: {}", e);
                    return None;
                }
            };
        Some(SubmissionRow {
            submission_id: Uuid::new_v4().to_string(),
            artwork_id: artwork_id.to_string(),
            client_ip: context.client_ip,
            user_agent: context.user_agent,
            submitted_at: context.submitted_at.to_rfc3339(),
            referral_source: context.referral_source,
            additional_data: context.additional_data.map(|v| v.to_string()),
        })
    }
}

fn lookup_values(fields: &MetadataFields, kind: LookupKind) -> Vec<String> {
    match kind {
        LookupKind::Keyword => fields.keyword_list(),
        LookupKind::Genre => fields.genre_list(),
        LookupKind::Creator => fields.creator_list(),
        LookupKind::Byline => fields.byline_list(),
    }
}

fn read_text(path: &Path) -> Result<String, CommitError> {
    fs::read_to_string(path).map_err(|e| {
        CommitError::Workspace(WorkspaceError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })
    })
}

/// Compacts the AI side document; anything that is not valid JSON is
/// stored as an empty object.
fn normalize_ai_metadata(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => value.to_string(),
        Err(e) => {
            warn!("AI metadata is not valid JSON, storing empty object: {}", e);
            "{}".to_string()
        }
    }
}
