//! Test harness for running whole pipeline runs against a temp directory.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pixlkey::pipeline::RecordingProgress;
use pixlkey::{
    Database, DownloadService, MemoryToolkit, PersistenceCommitter, Pipeline, PipelineConfig,
    PipelineError, RunId, RunRequest, RunResult, WorkspaceManager,
};
use tempfile::TempDir;

pub struct TestHarness {
    pub temp_dir: TempDir,
    pub processed_dir: PathBuf,
    pub db: Database,
    pub toolkit: Arc<MemoryToolkit>,
    pub config: PipelineConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_toolkit(MemoryToolkit::new())
    }

    pub fn with_toolkit(toolkit: MemoryToolkit) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let processed_dir = temp_dir.path().join("processed");
        let config = PipelineConfig::with_processed_directory(&processed_dir);
        let db = Database::open_in_memory().expect("Failed to open database");

        Self {
            temp_dir,
            processed_dir,
            db,
            toolkit: Arc::new(toolkit),
            config,
        }
    }

    /// Adjusts the pipeline configuration used by subsequent runs.
    pub fn configure(mut self, f: impl FnOnce(&mut PipelineConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            Arc::new(self.config.clone()),
            self.toolkit.clone(),
            self.db.clone(),
        )
    }

    pub fn committer(&self) -> PersistenceCommitter {
        PersistenceCommitter::new(
            self.db.clone(),
            WorkspaceManager::new(&self.processed_dir),
            self.toolkit.clone(),
            Duration::from_secs(5),
        )
    }

    pub fn downloads(&self) -> DownloadService {
        DownloadService::new(self.db.clone())
    }

    /// Runs `request` and returns the result with every reported event.
    pub fn run(
        &self,
        request: RunRequest,
    ) -> (Result<RunResult, PipelineError>, RecordingProgress) {
        let progress = RecordingProgress::new();
        let result = self.pipeline().run(request, &progress);
        (result, progress)
    }

    pub fn workspace_root(&self, owner_id: &str, run_id: &RunId) -> PathBuf {
        self.processed_dir.join(owner_id).join(run_id.as_str())
    }

    /// Writes a file outside the processed directory, e.g. a saved watermark.
    pub fn write_file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        fs::write(&path, bytes).expect("Failed to write file");
        path
    }

    /// Row count of any table.
    pub fn count(&self, table: &str) -> u32 {
        self.db
            .with_conn(|conn| {
                Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?)
            })
            .expect("Failed to count rows")
    }

    /// `(run_id, status)` of every registered run.
    pub fn runs(&self) -> Vec<(String, String)> {
        self.db
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT run_id, status FROM processing_runs ORDER BY rowid")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .expect("Failed to list runs")
    }

    /// Every `.zip` file below the processed directory.
    pub fn archives(&self) -> Vec<PathBuf> {
        fn walk(dir: &Path, found: &mut Vec<PathBuf>) {
            let Ok(entries) = fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, found);
                } else if path.extension().is_some_and(|ext| ext == "zip") {
                    found.push(path);
                }
            }
        }
        let mut found = Vec::new();
        walk(&self.processed_dir, &mut found);
        found
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
