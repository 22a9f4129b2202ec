//! PixlKey command line: certify artwork, commit runs, fetch archives.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use pixlkey::admission::{PROCESS_ACTION, DOWNLOAD_ACTION};
use pixlkey::logging::{self, LogFormat};
use pixlkey::pipeline::{ChannelProgress, EventLevel, ProgressEvent};
use pixlkey::{
    load_config, AdmissionGate, Config, Database, DownloadService, MemoryRateLimiter,
    MetadataFields, PersistenceCommitter, Pipeline, PipelineConfig, RateLimitPolicy, RunId,
    RunRequest, StandardToolkit, SubmissionContext, Upload, WatermarkChoice, WorkspaceManager,
};

#[derive(Parser, Debug)]
#[command(
    name = "pixlkey",
    version,
    about = "Watermark, fingerprint and certify digital artwork"
)]
struct Cli {
    /// Path to a JSON configuration file; built-in defaults when omitted
    #[arg(short, long, global = true, env = "PIXLKEY_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run images through the certification pipeline
    Process(ProcessArgs),

    /// Persist a completed run's artifacts to the database
    Commit(RunArgs),

    /// Write a completed run's archive to disk
    Download(DownloadArgs),
}

#[derive(Parser, Debug)]
struct ProcessArgs {
    /// Owner the run is registered to
    #[arg(long, env = "PIXLKEY_OWNER")]
    owner: String,

    /// JSON document with the descriptive fields (title, creation_date, ...)
    #[arg(long)]
    fields: PathBuf,

    /// One-off watermark image; overrides the saved watermark
    #[arg(long)]
    watermark: Option<PathBuf>,

    /// Licence text; the configured default when omitted
    #[arg(long)]
    licence: Option<String>,

    /// Client address recorded with the submission
    #[arg(long, default_value = "127.0.0.1")]
    client_ip: String,

    /// Images to certify
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[arg(long, env = "PIXLKEY_OWNER")]
    owner: String,

    #[arg(long)]
    run_id: String,
}

#[derive(Parser, Debug)]
struct DownloadArgs {
    #[command(flatten)]
    run: RunArgs,

    /// Directory the archive is written into
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format)?;

    let config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    let db = Database::open(&config.database_path).context("Failed to open database")?;

    let result = match cli.command {
        Commands::Process(args) => process(&config, db, args),
        Commands::Commit(args) => commit(&config, db, args),
        Commands::Download(args) => download(&config, db, args),
    };
    if let Err(ref e) = result {
        tracing::error!(error = %e, "Command failed");
    }
    result
}

fn gate(config: &Config, action: &'static str) -> Option<AdmissionGate> {
    let limits = &config.rate_limit;
    limits.enabled.then(|| {
        AdmissionGate::new(
            Arc::new(MemoryRateLimiter::new(Duration::from_secs(limits.window_secs))),
            RateLimitPolicy::from_config(limits),
            action,
        )
    })
}

fn process(config: &Config, db: Database, args: ProcessArgs) -> Result<()> {
    let fields_json = std::fs::read_to_string(&args.fields)
        .with_context(|| format!("Failed to read {}", args.fields.display()))?;
    let fields: MetadataFields =
        serde_json::from_str(&fields_json).context("Fields document is not valid JSON")?;

    let files = args
        .files
        .iter()
        .map(|path| {
            Upload::from_path(path).with_context(|| format!("Failed to read {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut request = RunRequest::new(&args.owner, files, fields)
        .with_submission(SubmissionContext::new(&args.client_ip));
    if let Some(path) = &args.watermark {
        let upload = Upload::from_path(path)
            .with_context(|| format!("Failed to read watermark {}", path.display()))?;
        request = request.with_watermark(WatermarkChoice::uploaded(upload));
    }
    if let Some(licence) = args.licence {
        request = request.with_licence(licence);
    }

    let mut pipeline = Pipeline::from_config(Arc::new(PipelineConfig::from_config(config)), db);
    if let Some(gate) = gate(config, PROCESS_ACTION) {
        pipeline = pipeline.with_admission(gate);
    }

    let (progress, events) = ChannelProgress::new();
    let printer = thread::spawn(move || {
        for event in events {
            print_event(&event);
        }
    });
    let result = pipeline.run(request, &progress);
    drop(progress);
    let _ = printer.join();

    let result = result?;
    info!(run_id = %result.run_id, "Archive written");
    println!("run_id: {}", result.run_id);
    println!("archive: {}", result.archive_path.display());
    Ok(())
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::Step {
            stage,
            level,
            file,
            message,
        } => {
            let marker = match level {
                EventLevel::Info => " ",
                EventLevel::Success => "+",
                EventLevel::Warning => "!",
                EventLevel::Error => "x",
            };
            match file {
                Some(file) => println!("[{}] {:<22} {}: {}", marker, stage, file, message),
                None => println!("[{}] {:<22} {}", marker, stage, message),
            }
        }
        ProgressEvent::FileSkipped {
            file,
            stage,
            reason,
        } => println!("[x] {:<22} skipped {}: {}", stage, file, reason),
        ProgressEvent::Completed {
            archive_name,
            files,
            ..
        } => println!("[+] completed: {} file(s) in {}", files, archive_name),
        ProgressEvent::Failed { stage, error } => println!("[x] {:<22} {}", stage, error),
    }
}

fn commit(config: &Config, db: Database, args: RunArgs) -> Result<()> {
    let run_id = RunId::parse(&args.run_id)?;
    let committer = PersistenceCommitter::new(
        db,
        WorkspaceManager::new(&config.processed_directory),
        Arc::new(StandardToolkit::new(&config.tools.exiftool_path)),
        Duration::from_secs(config.tools.stage_timeout_secs),
    );
    let receipt = committer.commit_from_workspace(&run_id, &args.owner)?;
    println!("artwork_id: {}", receipt.artwork_id);
    println!("images: {}", receipt.variants);
    Ok(())
}

fn download(config: &Config, db: Database, args: DownloadArgs) -> Result<()> {
    let mut service = DownloadService::new(db);
    if let Some(gate) = gate(config, DOWNLOAD_ACTION) {
        service = service.with_admission(gate);
    }
    let archive = service.fetch(&args.run.owner, &args.run.run_id, &args.run.owner)?;

    let destination = args.output.join(&archive.filename);
    std::fs::write(&destination, &archive.bytes)
        .with_context(|| format!("Failed to write {}", destination.display()))?;
    println!("{} ({} bytes)", destination.display(), archive.content_length);
    Ok(())
}
