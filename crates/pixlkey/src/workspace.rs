//! Per-run isolated directories under the processed root.
//!
//! Layout: `{processed_root}/{owner_id}/{run_id}/` holding, per completed
//! file, `{base}.png`, `{base}_signed.png`, `{base}_thumbnail.png`,
//! `{base}_preview.png`, `{base}_metadata.md` and `{base}_certificate.md`,
//! plus the run-level `data.json`, `submission.json`, `files.json` and the
//! final archive.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkspaceError;
use crate::sanitize;

pub const SIGNED_SUFFIX: &str = "_signed.png";
pub const THUMBNAIL_SUFFIX: &str = "_thumbnail.png";
pub const PREVIEW_SUFFIX: &str = "_preview.png";
pub const METADATA_SUFFIX: &str = "_metadata.md";
pub const CERTIFICATE_SUFFIX: &str = "_certificate.md";
pub const AI_METADATA_SUFFIX: &str = "_ai_metadata.json";
pub const DATA_DOCUMENT: &str = "data.json";
pub const SUBMISSION_DOCUMENT: &str = "submission.json";
pub const MANIFEST_DOCUMENT: &str = "files.json";
const WATERMARK_DIR: &str = "watermark";

/// Canonical lowercase hyphenated UUID identifying one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accepts only the 36-character lowercase hex-and-hyphen form.
    pub fn parse(raw: &str) -> Result<Self, WorkspaceError> {
        let well_formed = raw.len() == 36
            && raw
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c) || c == '-')
            && Uuid::parse_str(raw).is_ok();
        if well_formed {
            Ok(Self(raw.to_string()))
        } else {
            Err(WorkspaceError::InvalidIdentifier(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_owner_id(owner_id: &str) -> Result<(), WorkspaceError> {
    let ok = !owner_id.is_empty()
        && owner_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidIdentifier(owner_id.to_string()))
    }
}

/// Allocates and locates run workspaces beneath one processed root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base: PathBuf,
}

impl WorkspaceManager {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Creates `{base}/{owner_id}/{run_id}`. The run directory itself must
    /// not exist yet, so a colliding run id fails instead of sharing files.
    pub fn allocate(&self, owner_id: &str, run_id: &RunId) -> Result<RunWorkspace, WorkspaceError> {
        validate_owner_id(owner_id)?;

        let owner_dir = self.base.join(owner_id);
        fs::create_dir_all(&owner_dir).map_err(|e| WorkspaceError::CreateOwnerDirectory {
            path: owner_dir.clone(),
            source: e,
        })?;

        let root = owner_dir.join(run_id.as_str());
        fs::create_dir(&root).map_err(|e| WorkspaceError::CreateRunDirectory {
            path: root.clone(),
            source: e,
        })?;

        log::debug!("Allocated run workspace {}", run_id);

        Ok(RunWorkspace {
            root,
            owner_id: owner_id.to_string(),
            run_id: run_id.clone(),
        })
    }

    /// Opens an existing run workspace.
    pub fn locate(&self, owner_id: &str, run_id: &RunId) -> Result<RunWorkspace, WorkspaceError> {
        validate_owner_id(owner_id)?;
        let root = self.base.join(owner_id).join(run_id.as_str());
        if !root.is_dir() {
            return Err(WorkspaceError::NotFound(root));
        }
        Ok(RunWorkspace {
            root,
            owner_id: owner_id.to_string(),
            run_id: run_id.clone(),
        })
    }
}

/// Paths of every artifact derived from one input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    pub basename: String,
    pub upload: PathBuf,
    pub normalized: PathBuf,
    pub signed: PathBuf,
    pub thumbnail: PathBuf,
    pub preview: PathBuf,
    pub metadata_document: PathBuf,
    pub certificate: PathBuf,
    pub ai_metadata: PathBuf,
}

impl FileLayout {
    pub fn new(root: &Path, basename: &str, extension: &str) -> Self {
        let named = |suffix: &str| root.join(format!("{}{}", basename, suffix));
        Self {
            basename: basename.to_string(),
            upload: root.join(format!("{}.{}", basename, extension)),
            normalized: root.join(format!("{}.png", basename)),
            signed: named(SIGNED_SUFFIX),
            thumbnail: named(THUMBNAIL_SUFFIX),
            preview: named(PREVIEW_SUFFIX),
            metadata_document: named(METADATA_SUFFIX),
            certificate: named(CERTIFICATE_SUFFIX),
            ai_metadata: named(AI_METADATA_SUFFIX),
        }
    }

    /// Every path this file may write, including the stored upload.
    pub fn paths(&self) -> [&Path; 8] {
        [
            self.upload.as_path(),
            self.normalized.as_path(),
            self.signed.as_path(),
            self.thumbnail.as_path(),
            self.preview.as_path(),
            self.metadata_document.as_path(),
            self.certificate.as_path(),
            self.ai_metadata.as_path(),
        ]
    }

    /// Paths produced by the stages, i.e. everything but the stored upload
    /// and the externally supplied AI metadata.
    pub fn derived(&self) -> [&Path; 6] {
        [
            self.normalized.as_path(),
            self.signed.as_path(),
            self.thumbnail.as_path(),
            self.preview.as_path(),
            self.metadata_document.as_path(),
            self.certificate.as_path(),
        ]
    }
}

/// Base names of the files that completed every stage, in submission
/// order. Written next to the archive; the committer reads it instead of
/// guessing from file names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub completed: Vec<String>,
}

/// One allocated run directory.
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    root: PathBuf,
    owner_id: String,
    run_id: RunId,
}

impl RunWorkspace {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn layout(&self, basename: &str, extension: &str) -> FileLayout {
        FileLayout::new(&self.root, basename, extension)
    }

    pub fn archive_path(&self, base_name: &str) -> PathBuf {
        self.root.join(format!("{}.zip", base_name))
    }

    pub fn data_document_path(&self) -> PathBuf {
        self.root.join(DATA_DOCUMENT)
    }

    pub fn submission_document_path(&self) -> PathBuf {
        self.root.join(SUBMISSION_DOCUMENT)
    }

    /// Location for a one-off watermark upload. Kept in a subdirectory so
    /// it can never collide with a sanitized upload name.
    pub fn watermark_path(&self, extension: &str) -> PathBuf {
        self.root.join(WATERMARK_DIR).join(format!("custom.{}", extension))
    }

    pub fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<(), WorkspaceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| WorkspaceError::WriteFile {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        fs::write(path, bytes).map_err(|e| WorkspaceError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), WorkspaceError> {
        let json = serde_json::to_vec_pretty(value).map_err(|e| WorkspaceError::ParseDocument {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.write_bytes(path, &json)
    }

    /// Reads a JSON document; `Ok(None)` when the file is absent.
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, WorkspaceError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read(path).map_err(|e| WorkspaceError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| WorkspaceError::ParseDocument {
                path: path.to_path_buf(),
                source: e,
            })
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_DOCUMENT)
    }

    /// Layouts of the completed files listed in `files.json`; `Ok(None)`
    /// when the run never wrote one.
    pub fn completed_layouts(&self) -> Result<Option<Vec<FileLayout>>, WorkspaceError> {
        let Some(manifest) = self.read_json::<RunManifest>(&self.manifest_path())? else {
            return Ok(None);
        };
        manifest
            .completed
            .iter()
            .map(|basename| {
                if basename.is_empty() || sanitize::sanitize_basename(basename) != *basename {
                    return Err(WorkspaceError::InvalidIdentifier(basename.clone()));
                }
                Ok(self.layout(basename, "png"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Deletes the run directory and everything in it.
    pub fn remove(self) -> Result<(), WorkspaceError> {
        fs::remove_dir_all(&self.root).map_err(|e| WorkspaceError::Remove {
            path: self.root.clone(),
            source: e,
        })
    }
}
