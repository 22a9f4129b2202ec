use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, info_span, warn};

use crate::admission::{Admission, AdmissionGate};
use crate::archive::ArchiveBuilder;
use crate::config::EmbedPolicy;
use crate::db::{run_repo, Database};
use crate::error::ValidationError;
use crate::fingerprint::{fingerprint_file, Fingerprint};
use crate::sanitize;
use crate::submission::{resolve_licence, MetadataFields, ResolvedWatermark, Upload};
use crate::toolkit::{Deadline, ImageToolkit, Placement, StandardToolkit};
use crate::workspace::{FileLayout, RunId, RunManifest, RunWorkspace, WorkspaceManager};

use super::certificate::render_certificate;
use super::config::PipelineConfig;
use super::context::{FileContext, RunRequest, RunResult, SkippedFile, StageOutput};
use super::error::{PipelineError, StageError};
use super::progress::{ProgressEvent, ProgressReporter, Stage};
use super::provenance::{provenance_tags, render_metadata_document, DOCUMENT_ID_TAG};

const FALLBACK_BASENAME: &str = "artwork";

/// Run-wide values shared by every file's stages.
struct RunEnv<'a> {
    workspace: &'a RunWorkspace,
    fields: &'a MetadataFields,
    licence: &'a str,
    watermark: Option<&'a Path>,
    request: &'a RunRequest,
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    toolkit: Arc<dyn ImageToolkit>,
    db: Database,
    workspaces: WorkspaceManager,
    archiver: ArchiveBuilder,
    admission: Option<AdmissionGate>,
}

impl Pipeline {
    /// Production constructor: shells out to ExifTool and uses the
    /// `image` crate for raster work.
    pub fn from_config(config: Arc<PipelineConfig>, db: Database) -> Self {
        let toolkit: Arc<dyn ImageToolkit> = Arc::new(StandardToolkit::new(&config.exiftool_path));
        Self::new(config, toolkit, db)
    }

    pub fn new(config: Arc<PipelineConfig>, toolkit: Arc<dyn ImageToolkit>, db: Database) -> Self {
        let workspaces = WorkspaceManager::new(&config.processed_directory);
        Self {
            config,
            toolkit,
            db,
            workspaces,
            archiver: ArchiveBuilder::new(),
            admission: None,
        }
    }

    /// Gates every run through `gate` before any work starts.
    pub fn with_admission(mut self, gate: AdmissionGate) -> Self {
        self.admission = Some(gate);
        self
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Runs every file of `request` through the stages and packages the
    /// survivors into one archive.
    ///
    /// Per-file failures drop that file and are reported as
    /// [`ProgressEvent::FileSkipped`]; the run fails only when nothing
    /// survives or a run-level step (registry, workspace, archive) fails.
    pub fn run(
        &self,
        request: RunRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<RunResult, PipelineError> {
        let _run_span = info_span!("run",
            owner_id = %request.owner_id,
            files = request.files.len(),
        )
        .entered();

        // Step 1: Validate submission
        let fields = {
            let _step = info_span!("validate").entered();
            progress.report(ProgressEvent::info(
                Stage::Validate,
                None,
                "Validating submission...",
            ));
            self.step_validate(&request)
                .map_err(|e| self.report_failure(progress, Stage::Validate, e))?
        };

        // Step 2: Admission
        if let Some(gate) = &self.admission {
            let _step = info_span!("admission").entered();
            if let Admission::Denied { retry_after } = gate.enter(request.actor()) {
                return Err(self.report_failure(
                    progress,
                    Stage::Admission,
                    PipelineError::RateLimited { retry_after },
                ));
            }
        }

        // Step 3: Register run
        let run_id = RunId::generate();
        {
            let _step = info_span!("register", run_id = %run_id).entered();
            run_repo::register(&self.db, run_id.as_str(), &request.owner_id).map_err(|e| {
                self.report_failure(progress, Stage::Register, PipelineError::Registry(e))
            })?;
        }

        // Step 4: Allocate workspace and persist run documents
        let workspace = {
            let _step = info_span!("workspace", run_id = %run_id).entered();
            match self.step_prepare_workspace(&request, &run_id, &fields) {
                Ok(workspace) => workspace,
                Err(e) => {
                    self.mark_failed(&run_id, &e);
                    return Err(self.report_failure(progress, Stage::Workspace, e));
                }
            }
        };
        progress.report(ProgressEvent::info(
            Stage::Workspace,
            None,
            format!(
                "Workspace ready at {}",
                sanitize::display_path(self.workspaces.base(), workspace.root())
            ),
        ));

        // Step 5: Resolve watermark and licence
        let watermark = match self.step_resolve_watermark(&request, &workspace, progress) {
            Ok(watermark) => watermark,
            Err(e) => {
                self.mark_failed(&run_id, &e);
                return Err(self.report_failure(progress, Stage::Workspace, e));
            }
        };
        let licence = resolve_licence(request.licence.as_deref(), &self.config.default_licence);

        let env = RunEnv {
            workspace: &workspace,
            fields: &fields,
            licence: &licence,
            watermark: watermark.as_deref(),
            request: &request,
        };

        // Step 6: Per-file stages
        let mut claimed = HashSet::new();
        let mut outputs = Vec::new();
        let mut skipped = Vec::new();
        for upload in &request.files {
            if request.cancel.is_cancelled() {
                return Err(self.abort_cancelled(&run_id, &workspace, progress));
            }

            let _file_span =
                info_span!("file", name = %sanitize::redact_path(Path::new(&upload.original_name)))
                    .entered();
            match self.process_file(&env, upload, &mut claimed, progress) {
                Ok(output) => {
                    progress.report(ProgressEvent::success(
                        Stage::Certificate,
                        Some(&output.original_name),
                        "Certified",
                    ));
                    outputs.push(output);
                }
                Err((_, e)) if e.is_cancelled() => {
                    return Err(self.abort_cancelled(&run_id, &workspace, progress));
                }
                Err((stage, e)) => {
                    let reason = sanitize::redact_text(self.workspaces.base(), &e.to_string());
                    warn!(stage = %stage, "File skipped: {}", reason);
                    progress.report(ProgressEvent::FileSkipped {
                        file: upload.original_name.clone(),
                        stage,
                        reason: reason.clone(),
                    });
                    skipped.push(SkippedFile {
                        original_name: upload.original_name.clone(),
                        stage,
                        reason,
                    });
                }
            }
        }

        if outputs.is_empty() {
            let err = PipelineError::NoCompletedFiles;
            self.mark_failed(&run_id, &err);
            return Err(self.report_failure(progress, Stage::Finalize, err));
        }

        // Step 7: Archive
        let archive_path = {
            let _step = info_span!("archive").entered();
            progress.report(ProgressEvent::info(
                Stage::Archive,
                None,
                format!("Packaging {} file(s)...", outputs.len()),
            ));
            match self.step_archive(&request, &workspace, &outputs) {
                Ok(path) => path,
                Err(e) => {
                    self.mark_failed(&run_id, &e);
                    return Err(self.report_failure(progress, Stage::Archive, e));
                }
            }
        };
        let archive_name = sanitize::redact_path(&archive_path);

        // Step 8: Record the archive; only now is the run usable
        {
            let _step = info_span!("finalize").entered();
            if let Err(e) = run_repo::record_archive(
                &self.db,
                run_id.as_str(),
                &archive_path.to_string_lossy(),
            ) {
                let err = PipelineError::Registry(e);
                self.mark_failed(&run_id, &err);
                return Err(self.report_failure(progress, Stage::Finalize, err));
            }
            if let Some(gate) = &self.admission {
                gate.clear(request.actor());
            }
        }

        info!(
            run_id = %run_id,
            completed = outputs.len(),
            skipped = skipped.len(),
            "Run completed: {}",
            archive_name
        );
        progress.report(ProgressEvent::Completed {
            run_id: run_id.to_string(),
            archive_name: archive_name.clone(),
            files: outputs.len(),
        });

        Ok(RunResult {
            run_id,
            archive_path,
            archive_name,
            outputs,
            skipped,
        })
    }

    // ── Run-level steps ──────────────────────────────────────────────

    fn step_validate(&self, request: &RunRequest) -> Result<MetadataFields, PipelineError> {
        let fields = request.fields.clone().trimmed();
        fields.validate()?;

        if request.files.is_empty() {
            return Err(ValidationError::NoFiles.into());
        }
        let limit = self.config.max_upload_bytes;
        if let Some(upload) = request.files.iter().find(|u| u.size() > limit) {
            return Err(ValidationError::FileTooLarge {
                name: upload.original_name.clone(),
                size: upload.size(),
                limit,
            }
            .into());
        }
        Ok(fields)
    }

    fn step_prepare_workspace(
        &self,
        request: &RunRequest,
        run_id: &RunId,
        fields: &MetadataFields,
    ) -> Result<RunWorkspace, PipelineError> {
        let workspace = self.workspaces.allocate(&request.owner_id, run_id)?;
        workspace.write_json(&workspace.data_document_path(), fields)?;
        if let Some(submission) = &request.submission {
            workspace.write_json(&workspace.submission_document_path(), submission)?;
        }
        debug!(
            "Allocated workspace {}",
            sanitize::display_path(self.workspaces.base(), workspace.root())
        );
        Ok(workspace)
    }

    /// The uploaded watermark wins over the saved selection, which wins
    /// over the configured default. An upload with a disallowed extension
    /// is ignored.
    fn step_resolve_watermark(
        &self,
        request: &RunRequest,
        workspace: &RunWorkspace,
        progress: &dyn ProgressReporter,
    ) -> Result<Option<PathBuf>, PipelineError> {
        let choice = request.watermark.clone();
        let saved = choice.saved.clone();
        let resolved = match choice.resolve() {
            Ok(resolved) => resolved,
            Err(e) => {
                progress.report(ProgressEvent::info(
                    Stage::Watermark,
                    None,
                    format!("{}; using the saved watermark instead", e),
                ));
                saved.map(ResolvedWatermark::Saved)
            }
        };

        match resolved {
            Some(ResolvedWatermark::Uploaded(upload)) => {
                let path = workspace.watermark_path(&upload.declared_extension);
                workspace.write_bytes(&path, &upload.bytes)?;
                Ok(Some(path))
            }
            Some(ResolvedWatermark::Saved(path)) => Ok(Some(path)),
            None => Ok(self.config.saved_watermark.clone()),
        }
    }

    fn step_archive(
        &self,
        request: &RunRequest,
        workspace: &RunWorkspace,
        outputs: &[StageOutput],
    ) -> Result<PathBuf, PipelineError> {
        let names: Vec<&str> = request
            .files
            .iter()
            .map(|u| u.original_name.as_str())
            .collect();
        let destination = workspace.archive_path(&sanitize::archive_base_name(&names));
        let manifest = RunManifest {
            completed: outputs.iter().map(|o| o.basename.clone()).collect(),
        };
        workspace.write_json(&workspace.manifest_path(), &manifest)?;
        let entries: Vec<PathBuf> = outputs
            .iter()
            .flat_map(|o| o.files())
            .map(Path::to_path_buf)
            .collect();
        Ok(self.archiver.build(&destination, &entries)?)
    }

    fn abort_cancelled(
        &self,
        run_id: &RunId,
        workspace: &RunWorkspace,
        progress: &dyn ProgressReporter,
    ) -> PipelineError {
        let err = PipelineError::Cancelled;
        if let Err(e) = workspace.clone().remove() {
            warn!("Failed to remove cancelled workspace: {}", e);
        }
        self.mark_failed(run_id, &err);
        self.report_failure(progress, Stage::Finalize, err)
    }

    fn mark_failed(&self, run_id: &RunId, err: &PipelineError) {
        let message = sanitize::redact_text(self.workspaces.base(), &err.to_string());
        if let Err(e) = run_repo::mark_failed(&self.db, run_id.as_str(), &message) {
            warn!(run_id = %run_id, "Failed to mark run failed: {}", e);
        }
    }

    fn report_failure(
        &self,
        progress: &dyn ProgressReporter,
        stage: Stage,
        err: PipelineError,
    ) -> PipelineError {
        let message = sanitize::redact_text(self.workspaces.base(), &err.to_string());
        warn!(stage = %stage, "Run failed: {}", message);
        progress.report(ProgressEvent::Failed {
            stage,
            error: message,
        });
        err
    }

    // ── Per-file stages ──────────────────────────────────────────────

    fn process_file(
        &self,
        env: &RunEnv<'_>,
        upload: &Upload,
        claimed: &mut HashSet<PathBuf>,
        progress: &dyn ProgressReporter,
    ) -> Result<StageOutput, (Stage, StageError)> {
        let file = upload.original_name.as_str();

        let ctx = self.run_stage(Stage::StoreUpload, file, progress, "Storing upload...", || {
            self.step_store_upload(env, upload, claimed)
        })?;

        self.certify(env, ctx, progress).map_err(|(stage, e, layout)| {
            discard_partial(&layout);
            (stage, e)
        })
    }

    /// Every stage after the upload is stored. On failure the layout comes
    /// back so the caller can remove what was already written.
    fn certify(
        &self,
        env: &RunEnv<'_>,
        ctx: FileContext,
        progress: &dyn ProgressReporter,
    ) -> Result<StageOutput, (Stage, StageError, FileLayout)> {
        match self.certify_stages(env, &ctx, progress) {
            Ok((pre_embed, post_embed, embedded)) => {
                let layout = ctx.layout;
                Ok(StageOutput {
                    original_name: ctx.original_name,
                    basename: layout.basename,
                    signed_image_path: layout.signed,
                    thumbnail_path: layout.thumbnail,
                    preview_path: layout.preview,
                    metadata_document_path: layout.metadata_document,
                    certificate_path: layout.certificate,
                    pre_embed_fingerprint: pre_embed,
                    post_embed_fingerprint: post_embed,
                    embedded,
                })
            }
            Err((stage, e)) => Err((stage, e, ctx.layout)),
        }
    }

    fn certify_stages(
        &self,
        env: &RunEnv<'_>,
        ctx: &FileContext,
        progress: &dyn ProgressReporter,
    ) -> Result<(Fingerprint, Fingerprint, bool), (Stage, StageError)> {
        let file = ctx.original_name.as_str();

        if let Err((_, e)) =
            self.run_stage(Stage::StripMetadata, file, progress, "Stripping metadata...", || {
                self.step_strip_metadata(env, ctx)
            })
        {
            if e.is_cancelled() {
                return Err((Stage::StripMetadata, e));
            }
            progress.report(ProgressEvent::warning(
                Stage::StripMetadata,
                Some(file),
                format!(
                    "Could not strip metadata: {}",
                    sanitize::redact_text(self.workspaces.base(), &e.to_string())
                ),
            ));
        }

        self.run_stage(Stage::NormalizeFormat, file, progress, "Converting to PNG...", || {
            self.step_normalize(env, ctx)
        })?;

        self.run_stage(Stage::Watermark, file, progress, "Applying watermark...", || {
            self.step_watermark(env, &[&ctx.layout.signed], &self.config.signed_placement)
        })?;

        let pre_embed = self.run_stage(
            Stage::FingerprintPreEmbed,
            file,
            progress,
            "Fingerprinting signed image...",
            || hash(&ctx.layout.signed),
        )?;

        let embedded = match self.run_stage(
            Stage::EmbedMetadata,
            file,
            progress,
            "Embedding metadata...",
            || self.step_embed_metadata(env, ctx, &pre_embed),
        ) {
            Ok(()) => true,
            Err((stage, e)) if e.is_cancelled() => return Err((stage, e)),
            Err((stage, e)) => match self.config.embed_policy {
                EmbedPolicy::Fatal => return Err((stage, e)),
                EmbedPolicy::Lenient => {
                    progress.report(ProgressEvent::warning(
                        stage,
                        Some(file),
                        format!(
                            "Metadata not embedded: {}",
                            sanitize::redact_text(self.workspaces.base(), &e.to_string())
                        ),
                    ));
                    false
                }
            },
        };

        let post_embed = self.run_stage(
            Stage::FingerprintPostEmbed,
            file,
            progress,
            "Fingerprinting embedded image...",
            || step_fingerprint_post(ctx, &pre_embed, embedded),
        )?;

        self.run_stage(Stage::Derivatives, file, progress, "Generating thumbnail and preview...", || {
            self.step_derivatives(env, ctx)
        })?;

        self.run_stage(
            Stage::WatermarkDerivatives,
            file,
            progress,
            "Watermarking thumbnail and preview...",
            || {
                self.step_watermark(
                    env,
                    &[&ctx.layout.thumbnail, &ctx.layout.preview],
                    &self.config.derivative_placement,
                )
            },
        )?;

        self.run_stage(Stage::ExtractMetadata, file, progress, "Reading back metadata...", || {
            self.step_extract_metadata(env, ctx, &pre_embed, embedded)
        })?;

        self.run_stage(Stage::Certificate, file, progress, "Writing certificate...", || {
            self.step_certificate(env, ctx, &pre_embed, &post_embed)
        })?;

        Ok((pre_embed, post_embed, embedded))
    }

    fn run_stage<T, F>(
        &self,
        stage: Stage,
        file: &str,
        progress: &dyn ProgressReporter,
        message: &str,
        f: F,
    ) -> Result<T, (Stage, StageError)>
    where
        F: FnOnce() -> Result<T, StageError>,
    {
        let _step = info_span!("stage", name = %stage).entered();
        progress.report(ProgressEvent::info(stage, Some(file), message));
        f().map_err(|e| (stage, e))
    }

    fn deadline(&self, env: &RunEnv<'_>) -> Deadline {
        Deadline::after(self.config.stage_timeout, env.request.cancel.clone())
    }

    fn step_store_upload(
        &self,
        env: &RunEnv<'_>,
        upload: &Upload,
        claimed: &mut HashSet<PathBuf>,
    ) -> Result<FileContext, StageError> {
        let extension = upload.declared_extension.as_str();
        if !self.config.accepts_extension(extension) {
            return Err(StageError::UnsupportedExtension(extension.to_string()));
        }

        // A base name is free only when none of its artifact paths belong
        // to an earlier file: `a_signed.jpg` would otherwise normalize onto
        // the signed image of `a.jpg`.
        let stem = sanitize::sanitized_stem(&upload.original_name)
            .unwrap_or_else(|| FALLBACK_BASENAME.to_string());
        let mut layout = env.workspace.layout(&stem, extension);
        let mut counter = 2;
        while layout.paths().iter().any(|p| claimed.contains(*p)) {
            layout = env
                .workspace
                .layout(&format!("{}_{}", stem, counter), extension);
            counter += 1;
        }
        claimed.extend(layout.paths().iter().map(|p| p.to_path_buf()));

        env.workspace.write_bytes(&layout.upload, &upload.bytes)?;
        debug!("Stored upload as {}", sanitize::redact_path(&layout.upload));
        Ok(FileContext::new(&upload.original_name, layout))
    }

    fn step_strip_metadata(&self, env: &RunEnv<'_>, ctx: &FileContext) -> Result<(), StageError> {
        self.toolkit
            .strip_metadata(&ctx.layout.upload, &self.deadline(env))?;
        Ok(())
    }

    /// Re-encodes the upload as PNG and takes the signed copy from it.
    fn step_normalize(&self, env: &RunEnv<'_>, ctx: &FileContext) -> Result<(), StageError> {
        let layout = &ctx.layout;
        self.toolkit
            .normalize(&layout.upload, &layout.normalized, &self.deadline(env))?;
        fs::copy(&layout.normalized, &layout.signed).map_err(|e| StageError::Io {
            path: layout.signed.clone(),
            source: e,
        })?;
        Ok(())
    }

    fn step_watermark(
        &self,
        env: &RunEnv<'_>,
        targets: &[&Path],
        placement: &Placement,
    ) -> Result<(), StageError> {
        let Some(watermark) = env.watermark else {
            debug!("No watermark selected");
            return Ok(());
        };
        for target in targets {
            self.toolkit
                .composite(target, watermark, placement, &self.deadline(env))?;
        }
        Ok(())
    }

    fn step_embed_metadata(
        &self,
        env: &RunEnv<'_>,
        ctx: &FileContext,
        pre_embed: &Fingerprint,
    ) -> Result<(), StageError> {
        let tags = provenance_tags(env.fields, env.licence, pre_embed);
        self.toolkit
            .write_tags(&ctx.layout.signed, &tags, &self.deadline(env))?;
        Ok(())
    }

    fn step_derivatives(&self, env: &RunEnv<'_>, ctx: &FileContext) -> Result<(), StageError> {
        let layout = &ctx.layout;
        self.toolkit.resize(
            &layout.signed,
            &layout.thumbnail,
            self.config.thumbnail_size,
            &self.deadline(env),
        )?;
        self.toolkit.resize(
            &layout.signed,
            &layout.preview,
            self.config.preview_size,
            &self.deadline(env),
        )?;
        Ok(())
    }

    /// Reads the signed image's tags back, checks the embedded identifier
    /// survived, and writes the metadata document.
    fn step_extract_metadata(
        &self,
        env: &RunEnv<'_>,
        ctx: &FileContext,
        pre_embed: &Fingerprint,
        embedded: bool,
    ) -> Result<(), StageError> {
        let tags = self
            .toolkit
            .read_tags(&ctx.layout.signed, &self.deadline(env))?;
        if embedded {
            let expected = pre_embed.document_id();
            if tags.get(DOCUMENT_ID_TAG) != Some(&expected) {
                return Err(StageError::MetadataMismatch);
            }
        }
        let document = render_metadata_document(&tags);
        env.workspace
            .write_bytes(&ctx.layout.metadata_document, document.as_bytes())?;
        Ok(())
    }

    fn step_certificate(
        &self,
        env: &RunEnv<'_>,
        ctx: &FileContext,
        pre_embed: &Fingerprint,
        post_embed: &Fingerprint,
    ) -> Result<(), StageError> {
        let certificate = render_certificate(env.fields, env.licence, pre_embed, post_embed);
        env.workspace
            .write_bytes(&ctx.layout.certificate, certificate.as_bytes())?;
        Ok(())
    }
}

/// Best-effort removal of a dropped file's stage outputs so nothing half
/// certified is left beside the completed files.
fn discard_partial(layout: &FileLayout) {
    for path in layout.derived() {
        match fs::remove_file(path) {
            Ok(()) => debug!("Discarded {}", sanitize::redact_path(path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to discard {}: {}", sanitize::redact_path(path), e),
        }
    }
}

fn hash(path: &Path) -> Result<Fingerprint, StageError> {
    fingerprint_file(path).map_err(|e| StageError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// An embedded file must hash differently from its pre-embed state.
fn step_fingerprint_post(
    ctx: &FileContext,
    pre_embed: &Fingerprint,
    embedded: bool,
) -> Result<Fingerprint, StageError> {
    let post_embed = hash(&ctx.layout.signed)?;
    if embedded && &post_embed == pre_embed {
        return Err(StageError::FingerprintUnchanged);
    }
    Ok(post_embed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::run_repo::RunStatus;
    use crate::pipeline::progress::{EventLevel, NoopProgress, RecordingProgress};
    use crate::toolkit::memory::{FakeImage, Operation};
    use crate::toolkit::MemoryToolkit;
    use tempfile::TempDir;

    fn fields() -> MetadataFields {
        MetadataFields {
            title: "Sunset".to_string(),
            creation_date: "2024-03-15".to_string(),
            byline_name: "Ada".to_string(),
            keywords: "sun, sea".to_string(),
            ..Default::default()
        }
    }

    fn setup(toolkit: MemoryToolkit) -> (TempDir, Pipeline, Database) {
        let temp = TempDir::new().unwrap();
        let config = PipelineConfig::with_processed_directory(temp.path().join("processed"));
        let db = Database::open_in_memory().unwrap();
        let pipeline = Pipeline::new(Arc::new(config), Arc::new(toolkit), db.clone());
        (temp, pipeline, db)
    }

    fn upload(name: &str) -> Upload {
        Upload::new(name, MemoryToolkit::image_bytes("jpeg", 1200, 900))
    }

    #[test]
    fn test_single_file_run_produces_all_artifacts() {
        let (_temp, pipeline, db) = setup(MemoryToolkit::new());
        let progress = RecordingProgress::new();
        let request = RunRequest::new("u1", vec![upload("My Sunset!!.jpg")], fields());

        let result = pipeline.run(request, &progress).unwrap();

        assert_eq!(result.archive_name, "My_Sunset__.zip");
        assert_eq!(result.outputs.len(), 1);
        let output = &result.outputs[0];
        for path in output.files() {
            assert!(path.exists(), "missing {}", path.display());
        }
        assert_ne!(output.pre_embed_fingerprint, output.post_embed_fingerprint);
        assert!(output.embedded);

        let row = run_repo::find_by_id(&db, result.run_id.as_str()).unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Completed);
        assert_eq!(row.zip_path.as_deref(), Some(&*result.archive_path.to_string_lossy()));

        assert!(matches!(
            progress.events().last(),
            Some(ProgressEvent::Completed { files: 1, .. })
        ));
    }

    #[test]
    fn test_invalid_date_rejected_before_registration() {
        let (_temp, pipeline, db) = setup(MemoryToolkit::new());
        let mut bad = fields();
        bad.creation_date = "2024-02-30".to_string();

        let err = pipeline
            .run(RunRequest::new("u1", vec![upload("a.jpg")], bad), &NoopProgress)
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Validation(ValidationError::InvalidDate(_))
        ));
        let runs: u32 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM processing_runs", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(runs, 0);
    }

    #[test]
    fn test_lenient_embed_failure_keeps_file() {
        let temp = TempDir::new().unwrap();
        let mut config = PipelineConfig::with_processed_directory(temp.path());
        config.embed_policy = EmbedPolicy::Lenient;
        let toolkit = MemoryToolkit::new().failing(Operation::WriteTags, "_signed");
        let pipeline = Pipeline::new(
            Arc::new(config),
            Arc::new(toolkit),
            Database::open_in_memory().unwrap(),
        );
        let progress = RecordingProgress::new();

        let result = pipeline
            .run(RunRequest::new("u1", vec![upload("a.jpg")], fields()), &progress)
            .unwrap();

        let output = &result.outputs[0];
        assert!(!output.embedded);
        assert_eq!(output.pre_embed_fingerprint, output.post_embed_fingerprint);
        assert!(progress.events().iter().any(|e| matches!(
            e,
            ProgressEvent::Step { stage: Stage::EmbedMetadata, level: EventLevel::Warning, .. }
        )));
    }

    #[test]
    fn test_fatal_embed_failure_skips_file() {
        let toolkit = MemoryToolkit::new().failing(Operation::WriteTags, "bad");
        let (_temp, pipeline, _db) = setup(toolkit);

        let result = pipeline
            .run(
                RunRequest::new("u1", vec![upload("good.jpg"), upload("bad.jpg")], fields()),
                &RecordingProgress::new(),
            )
            .unwrap();

        assert_eq!(result.outputs.len(), 1);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].stage, Stage::EmbedMetadata);
        assert_eq!(result.archive_name, "final_assets.zip");
    }

    #[test]
    fn test_duplicate_basenames_get_numbered() {
        let (_temp, pipeline, _db) = setup(MemoryToolkit::new());

        let result = pipeline
            .run(
                RunRequest::new("u1", vec![upload("a.jpg"), upload("a.png")], fields()),
                &RecordingProgress::new(),
            )
            .unwrap();

        let signed: Vec<String> = result
            .outputs
            .iter()
            .map(|o| sanitize::redact_path(&o.signed_image_path))
            .collect();
        assert_eq!(signed, vec!["a_signed.png", "a_2_signed.png"]);
    }

    #[test]
    fn test_strip_failure_is_a_warning() {
        let toolkit = MemoryToolkit::new().failing(Operation::StripMetadata, "a");
        let (_temp, pipeline, _db) = setup(toolkit);
        let progress = RecordingProgress::new();

        let result = pipeline
            .run(RunRequest::new("u1", vec![upload("a.jpg")], fields()), &progress)
            .unwrap();

        assert_eq!(result.outputs.len(), 1);
        assert!(progress.events().iter().any(|e| matches!(
            e,
            ProgressEvent::Step { stage: Stage::StripMetadata, level: EventLevel::Warning, .. }
        )));
    }

    #[test]
    fn test_watermark_marks_signed_copy() {
        let temp = TempDir::new().unwrap();
        let mark = temp.path().join("mark.png");
        fs::write(&mark, MemoryToolkit::image_bytes("png", 200, 100)).unwrap();
        let mut config = PipelineConfig::with_processed_directory(temp.path().join("processed"));
        config.saved_watermark = Some(mark);
        let pipeline = Pipeline::new(
            Arc::new(config),
            Arc::new(MemoryToolkit::new()),
            Database::open_in_memory().unwrap(),
        );

        let result = pipeline
            .run(
                RunRequest::new("u1", vec![upload("a.jpg")], fields()),
                &RecordingProgress::new(),
            )
            .unwrap();

        let signed = FakeImage::read(&result.outputs[0].signed_image_path).unwrap();
        assert_eq!(signed.marks, vec!["120x60@1056,816".to_string()]);
        let thumbnail = FakeImage::read(&result.outputs[0].thumbnail_path).unwrap();
        assert_eq!(thumbnail.marks.len(), 1);
    }

    fn skipped_stage(progress: &RecordingProgress) -> Option<Stage> {
        progress.events().iter().find_map(|e| match e {
            ProgressEvent::FileSkipped { stage, .. } => Some(*stage),
            _ => None,
        })
    }

    #[test]
    fn test_unchanged_fingerprint_after_embed_skips_file() {
        let (_temp, pipeline, _db) = setup(MemoryToolkit::new().discarding_tags());
        let progress = RecordingProgress::new();

        let err = pipeline
            .run(RunRequest::new("u1", vec![upload("a.jpg")], fields()), &progress)
            .unwrap_err();

        assert!(matches!(err, PipelineError::NoCompletedFiles));
        assert_eq!(skipped_stage(&progress), Some(Stage::FingerprintPostEmbed));
    }

    #[test]
    fn test_wrong_document_id_on_read_back_skips_file() {
        let toolkit = MemoryToolkit::new().overriding_tag(DOCUMENT_ID_TAG, "uuid:someone-else");
        let (_temp, pipeline, _db) = setup(toolkit);
        let progress = RecordingProgress::new();

        let err = pipeline
            .run(RunRequest::new("u1", vec![upload("a.jpg")], fields()), &progress)
            .unwrap_err();

        assert!(matches!(err, PipelineError::NoCompletedFiles));
        assert_eq!(skipped_stage(&progress), Some(Stage::ExtractMetadata));
    }

    #[test]
    fn test_skipped_file_leaves_no_stage_outputs() {
        let toolkit = MemoryToolkit::new().failing(Operation::WriteTags, "bad");
        let (_temp, pipeline, _db) = setup(toolkit);

        let result = pipeline
            .run(
                RunRequest::new("u1", vec![upload("good.jpg"), upload("bad.jpg")], fields()),
                &NoopProgress,
            )
            .unwrap();

        let root = result.outputs[0].signed_image_path.parent().unwrap();
        assert!(root.join("good_signed.png").exists());
        assert!(!root.join("bad.png").exists());
        assert!(!root.join("bad_signed.png").exists());

        let workspace = pipeline
            .workspaces()
            .locate("u1", &result.run_id)
            .unwrap();
        let manifest: RunManifest = workspace
            .read_json(&workspace.manifest_path())
            .unwrap()
            .unwrap();
        assert_eq!(manifest.completed, vec!["good".to_string()]);
    }

    #[test]
    fn test_name_matching_a_derived_artifact_is_renumbered() {
        let (_temp, pipeline, _db) = setup(MemoryToolkit::new());

        let result = pipeline
            .run(
                RunRequest::new("u1", vec![upload("a.jpg"), upload("a_signed.jpg")], fields()),
                &NoopProgress,
            )
            .unwrap();

        let basenames: Vec<&str> = result.outputs.iter().map(|o| o.basename.as_str()).collect();
        assert_eq!(basenames, vec!["a", "a_signed_2"]);
    }
}
