//! End-to-end pipeline runs against the in-memory toolkit.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use pixlkey::admission::PROCESS_ACTION;
use pixlkey::archive;
use pixlkey::fingerprint::fingerprint_file;
use pixlkey::pipeline::{EventLevel, ProgressEvent, Stage};
use pixlkey::toolkit::memory::{FakeImage, Operation};
use pixlkey::toolkit::CancelToken;
use pixlkey::{
    AdmissionGate, MemoryRateLimiter, MemoryToolkit, PipelineError, RateLimitPolicy, RunRequest,
    Upload, ValidationError, WatermarkChoice,
};

fn file_name(path: &std::path::Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}

#[test]
fn test_archive_holds_five_entries_per_completed_file() {
    let harness =
        TestHarness::with_toolkit(MemoryToolkit::new().failing(Operation::Normalize, "broken"));
    let (result, progress) = harness.run(request(OWNER, &["a.jpg", "broken.jpg", "c.png"]));
    let result = result.unwrap();

    assert_eq!(result.outputs.len(), 2);
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(result.skipped[0].original_name, "broken.jpg");
    assert_eq!(result.skipped[0].stage, Stage::NormalizeFormat);
    assert_eq!(result.archive_name, "final_assets.zip");

    let entries: BTreeSet<String> = archive::entry_names(&result.archive_path)
        .unwrap()
        .into_iter()
        .collect();
    let expected: BTreeSet<String> = result
        .outputs
        .iter()
        .flat_map(|o| o.files())
        .map(file_name)
        .collect();
    assert_eq!(entries.len(), 10);
    assert_eq!(entries, expected);
    assert!(entries.contains("a_signed.png"));
    assert!(entries.contains("c_certificate.md"));

    assert!(progress.events().iter().any(|e| matches!(
        e,
        ProgressEvent::FileSkipped { file, stage: Stage::NormalizeFormat, .. } if file == "broken.jpg"
    )));
}

#[test]
fn test_embedding_changes_fingerprint() {
    let harness = TestHarness::new();
    let (result, _) = harness.run(request(OWNER, &["a.jpg", "b.jpg"]));

    for output in result.unwrap().outputs {
        assert!(output.embedded);
        assert_ne!(output.pre_embed_fingerprint, output.post_embed_fingerprint);
        assert_eq!(output.post_embed_fingerprint.as_str().len(), 64);
    }
}

#[test]
fn test_derived_names_never_overwrite_earlier_file() {
    for second in ["a_signed.jpg", "a_thumbnail.jpg", "a_preview.jpg"] {
        let harness = TestHarness::new();
        let (result, _) = harness.run(request(OWNER, &["a.jpg", second]));
        let result = result.unwrap();

        assert_eq!(result.outputs.len(), 2);
        for output in &result.outputs {
            assert_eq!(
                fingerprint_file(&output.signed_image_path).unwrap(),
                output.post_embed_fingerprint,
                "{} was overwritten",
                output.original_name
            );
        }
        let entries = archive::entry_names(&result.archive_path).unwrap();
        let unique: BTreeSet<&String> = entries.iter().collect();
        assert_eq!(unique.len(), 10);
    }
}

#[test]
fn test_run_with_no_surviving_files_fails_without_archive() {
    let harness = TestHarness::with_toolkit(MemoryToolkit::new().failing(Operation::Normalize, ""));
    let (result, progress) = harness.run(request(OWNER, &["a.jpg", "b.jpg"]));

    assert!(matches!(result, Err(PipelineError::NoCompletedFiles)));
    assert!(harness.archives().is_empty());

    let runs = harness.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].1, "failed");
    let zip: Option<String> = harness
        .db
        .with_conn(|conn| {
            Ok(conn.query_row("SELECT zip_path FROM processing_runs", [], |row| row.get(0))?)
        })
        .unwrap();
    assert!(zip.is_none());

    assert!(matches!(
        progress.events().last(),
        Some(ProgressEvent::Failed { stage: Stage::Finalize, .. })
    ));
}

#[test]
fn test_zero_files_rejected_before_registration() {
    let harness = TestHarness::new();
    let (result, _) = harness.run(RunRequest::new(OWNER, Vec::new(), fields()));

    assert!(matches!(
        result,
        Err(PipelineError::Validation(ValidationError::NoFiles))
    ));
    assert_eq!(harness.count("processing_runs"), 0);
}

#[test]
fn test_malformed_date_rejected_before_registration() {
    let harness = TestHarness::new();
    let mut bad = fields();
    bad.creation_date = "15/03/2024".to_string();
    let (result, _) = harness.run(RunRequest::new(OWNER, vec![image("a.jpg")], bad));

    assert!(matches!(
        result,
        Err(PipelineError::Validation(ValidationError::MalformedDate(_)))
    ));
    assert_eq!(harness.count("processing_runs"), 0);
    assert!(!harness.processed_dir.join(OWNER).exists());
}

#[test]
fn test_oversize_upload_aborts_before_workspace() {
    let harness = TestHarness::new().configure(|c| c.max_upload_bytes = 8);
    let (result, _) = harness.run(request(OWNER, &["a.jpg"]));

    assert!(matches!(
        result,
        Err(PipelineError::Validation(ValidationError::FileTooLarge { .. }))
    ));
    assert_eq!(harness.count("processing_runs"), 0);
    assert!(!harness.processed_dir.join(OWNER).exists());
}

#[test]
fn test_single_file_archive_uses_sanitized_name() {
    let harness = TestHarness::new();
    let (result, _) = harness.run(request(OWNER, &["My Sunset!!.png"]));
    let result = result.unwrap();

    assert_eq!(result.archive_name, "My_Sunset__.zip");
    assert_eq!(file_name(&result.archive_path), "My_Sunset__.zip");
    assert!(result.archive_path.starts_with(&harness.processed_dir));
}

#[test]
fn test_unsupported_extension_skips_only_that_file() {
    let harness = TestHarness::new();
    let (result, _) = harness.run(request(OWNER, &["notes.gif", "a.jpg"]));
    let result = result.unwrap();

    assert_eq!(result.outputs.len(), 1);
    assert_eq!(result.outputs[0].original_name, "a.jpg");
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(result.skipped[0].stage, Stage::StoreUpload);
}

#[test]
fn test_stage_timeout_skips_file() {
    let harness = TestHarness::with_toolkit(
        MemoryToolkit::new().slow(Operation::Resize, Duration::from_millis(200)),
    )
    .configure(|c| c.stage_timeout = Duration::from_millis(20));
    let (result, progress) = harness.run(request(OWNER, &["a.jpg"]));

    assert!(matches!(result, Err(PipelineError::NoCompletedFiles)));
    let skipped = progress
        .events()
        .into_iter()
        .find_map(|e| match e {
            ProgressEvent::FileSkipped { stage, reason, .. } => Some((stage, reason)),
            _ => None,
        })
        .unwrap();
    assert_eq!(skipped.0, Stage::Derivatives);
    assert!(skipped.1.contains("timed out"), "{}", skipped.1);
}

#[test]
fn test_cancelled_run_removes_workspace() {
    let harness = TestHarness::new();
    let cancel = CancelToken::new();
    cancel.cancel();
    let (result, _) = harness.run(request(OWNER, &["a.jpg"]).with_cancel(cancel));

    assert!(matches!(result, Err(PipelineError::Cancelled)));
    let runs = harness.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].1, "failed");
    let owner_dir = harness.processed_dir.join(OWNER);
    let leftovers = std::fs::read_dir(&owner_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[test]
fn test_uploaded_watermark_wins_over_saved() {
    let harness = TestHarness::new();
    let saved = harness.write_file("saved.png", &MemoryToolkit::image_bytes("png", 100, 100));
    let harness = harness.configure(|c| c.saved_watermark = Some(saved));

    let mark = Upload::new("mark.png", MemoryToolkit::image_bytes("png", 200, 100));
    let (result, _) =
        harness.run(request(OWNER, &["a.jpg"]).with_watermark(WatermarkChoice::uploaded(mark)));
    let result = result.unwrap();

    let signed = FakeImage::read(&result.outputs[0].signed_image_path).unwrap();
    assert_eq!(signed.marks, vec!["120x60@1056,816"]);
    let root = harness.workspace_root(OWNER, &result.run_id);
    assert!(root.join("watermark").join("custom.png").is_file());
}

#[test]
fn test_unsupported_watermark_upload_falls_back_to_saved() {
    let harness = TestHarness::new();
    let saved = harness.write_file("saved.png", &MemoryToolkit::image_bytes("png", 100, 100));
    let harness = harness.configure(|c| c.saved_watermark = Some(saved));

    let mark = Upload::new("mark.gif", MemoryToolkit::image_bytes("gif", 200, 100));
    let (result, progress) =
        harness.run(request(OWNER, &["a.jpg"]).with_watermark(WatermarkChoice::uploaded(mark)));
    let result = result.unwrap();

    let signed = FakeImage::read(&result.outputs[0].signed_image_path).unwrap();
    assert_eq!(signed.marks, vec!["120x120@1056,756"]);
    assert!(progress.events().iter().any(|e| matches!(
        e,
        ProgressEvent::Step { stage: Stage::Watermark, level: EventLevel::Info, file: None, .. }
    )));
}

#[test]
fn test_no_watermark_leaves_images_unmarked() {
    let harness = TestHarness::new();
    let (result, _) = harness.run(request(OWNER, &["a.jpg"]));
    let output = &result.unwrap().outputs[0];

    assert!(FakeImage::read(&output.signed_image_path).unwrap().marks.is_empty());
    assert!(FakeImage::read(&output.thumbnail_path).unwrap().marks.is_empty());
}

#[test]
fn test_documents_carry_fields_and_fingerprints() {
    let harness = TestHarness::new();
    let (result, _) = harness.run(request(OWNER, &["a.jpg"]).with_licence("CC BY 4.0"));
    let output = &result.unwrap().outputs[0];

    let certificate = std::fs::read_to_string(&output.certificate_path).unwrap();
    assert!(certificate.contains("*Sunset*"));
    assert!(certificate.contains("CC BY 4.0"));
    assert!(certificate.contains(output.post_embed_fingerprint.as_str()));
    assert!(certificate.contains(&output.pre_embed_fingerprint.document_id()));

    let metadata = std::fs::read_to_string(&output.metadata_document_path).unwrap();
    assert!(metadata.starts_with("# Digital Metadata for Artwork"));
    assert!(metadata.contains("Sunset"));
}

#[test]
fn test_run_documents_written_to_workspace() {
    let harness = TestHarness::new();
    let (result, _) = harness.run(request(OWNER, &["a.jpg"]));
    let root = harness.workspace_root(OWNER, &result.unwrap().run_id);

    let data: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(root.join("data.json")).unwrap()).unwrap();
    assert_eq!(data["title"], "Sunset");
    assert_eq!(data["creation_date"], "2024-03-15");

    let submission: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(root.join("submission.json")).unwrap())
            .unwrap();
    assert_eq!(submission["client_ip"], "203.0.113.7");
}

#[test]
fn test_events_never_expose_absolute_paths() {
    let harness = TestHarness::with_toolkit(MemoryToolkit::new().failing(Operation::Normalize, "b"));
    let (result, progress) = harness.run(request(OWNER, &["a.jpg", "b.jpg"]));
    result.unwrap();

    let base = harness.temp_dir.path().to_string_lossy().into_owned();
    for event in progress.events() {
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains(&base), "leaked path in {}", json);
    }
    assert!(progress.events().iter().any(|e| matches!(
        e,
        ProgressEvent::Step { stage: Stage::Workspace, message, .. } if message.contains(".../processed/")
    )));
}

#[test]
fn test_runs_of_different_owners_are_isolated() {
    let harness = TestHarness::new();
    let (first, _) = harness.run(request(OWNER, &["a.jpg"]));
    let (second, _) = harness.run(request(OTHER_OWNER, &["a.jpg"]));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_ne!(first.run_id, second.run_id);
    assert!(first
        .archive_path
        .starts_with(harness.processed_dir.join(OWNER)));
    assert!(second
        .archive_path
        .starts_with(harness.processed_dir.join(OTHER_OWNER)));
}

#[test]
fn test_rate_limited_run_is_never_registered() {
    let harness = TestHarness::with_toolkit(MemoryToolkit::new().failing(Operation::Normalize, ""));
    let pipeline = harness.pipeline().with_admission(AdmissionGate::new(
        Arc::new(MemoryRateLimiter::new(Duration::from_secs(60))),
        RateLimitPolicy::new(1, Duration::from_secs(60)),
        PROCESS_ACTION,
    ));
    let progress = pixlkey::pipeline::NoopProgress;

    let first = pipeline.run(request(OWNER, &["a.jpg"]), &progress);
    assert!(matches!(first, Err(PipelineError::NoCompletedFiles)));

    let second = pipeline.run(request(OWNER, &["a.jpg"]), &progress);
    assert!(matches!(second, Err(PipelineError::RateLimited { .. })));
    assert_eq!(harness.count("processing_runs"), 1);
}
