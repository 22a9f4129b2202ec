//! Packages completed output sets into the run's downloadable zip.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::ArchiveError;
use crate::sanitize;

/// Builds archives atomically: entries are written to a `.partial` sibling
/// that is renamed into place only after the zip is finalized.
#[derive(Debug, Clone, Default)]
pub struct ArchiveBuilder;

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Writes every file in `entries` at the archive root under its base
    /// name. Fails without leaving anything at `destination` if any entry
    /// is missing or unreadable.
    pub fn build(&self, destination: &Path, entries: &[PathBuf]) -> Result<PathBuf, ArchiveError> {
        if entries.is_empty() {
            return Err(ArchiveError::Empty);
        }
        if let Some(missing) = entries.iter().find(|p| !p.is_file()) {
            return Err(ArchiveError::MissingEntry(missing.clone()));
        }

        let partial = destination.with_extension("zip.partial");
        let result = self.write_zip(&partial, entries).and_then(|()| {
            fs::rename(&partial, destination).map_err(|e| ArchiveError::Finalize {
                path: destination.to_path_buf(),
                source: e,
            })
        });

        if let Err(e) = result {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }

        info!(
            archive = %sanitize::redact_path(destination),
            entries = entries.len(),
            "Archive built"
        );
        Ok(destination.to_path_buf())
    }

    fn write_zip(&self, path: &Path, entries: &[PathBuf]) -> Result<(), ArchiveError> {
        let file = File::create(path).map_err(|e| ArchiveError::Create {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for entry in entries {
            let name = sanitize::redact_path(entry);
            debug!(entry = %name, "Adding archive entry");
            zip.start_file(name.as_str(), options)?;
            let mut source = File::open(entry).map_err(|e| ArchiveError::AddEntry {
                path: entry.clone(),
                source: e,
            })?;
            io::copy(&mut source, &mut zip).map_err(|e| ArchiveError::AddEntry {
                path: entry.clone(),
                source: e,
            })?;
        }

        zip.finish()?;
        Ok(())
    }
}

/// Names of the entries in an existing archive, in stored order.
pub fn entry_names(path: &Path) -> Result<Vec<String>, ArchiveError> {
    let file = File::open(path).map_err(|e| ArchiveError::Create {
        path: path.to_path_buf(),
        source: e,
    })?;
    let archive = ZipArchive::new(file)?;
    Ok(archive.file_names().map(str::to_string).collect())
}
