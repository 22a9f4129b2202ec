//! Image transform capability used by the processing stages.
//!
//! [`ImageToolkit`] is the seam between the pipeline and whatever actually
//! touches pixels and metadata. [`StandardToolkit`] decodes and encodes
//! rasters with the `image` crate and reads/writes tags through ExifTool;
//! [`MemoryToolkit`] is a deterministic fake for tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod standard;

pub use memory::MemoryToolkit;
pub use standard::StandardToolkit;

/// Metadata tags keyed by ExifTool tag name.
pub type TagSet = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum ToolkitError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode '{path}': {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("Failed to encode '{path}': {reason}")]
    Encode { path: PathBuf, reason: String },

    #[error("Failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with status {status:?}: {stderr}")]
    Tool {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Unreadable {tool} output: {reason}")]
    Output { tool: String, reason: String },

    #[error("{operation} timed out")]
    TimedOut { operation: &'static str },

    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },
}

impl ToolkitError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Shared cancellation flag for a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Time budget for one toolkit call, combined with the run's cancel flag.
#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Option<Instant>,
    cancel: CancelToken,
}

impl Deadline {
    pub fn after(budget: Duration, cancel: CancelToken) -> Self {
        Self {
            expires_at: Some(Instant::now() + budget),
            cancel,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            expires_at: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|t| t.saturating_duration_since(Instant::now()))
    }

    /// Fails when the run was cancelled or the budget is spent.
    pub fn check(&self, operation: &'static str) -> Result<(), ToolkitError> {
        if self.cancel.is_cancelled() {
            return Err(ToolkitError::Cancelled { operation });
        }
        if self.is_expired() {
            return Err(ToolkitError::TimedOut { operation });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Anchor {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Scales to fit inside a `max_edge` square, preserving aspect ratio.
    /// Smaller images are enlarged.
    pub fn fit_within(&self, max_edge: u32) -> Dimensions {
        let longest = self.width.max(self.height).max(1) as f64;
        let scale = max_edge as f64 / longest;
        Dimensions {
            width: ((self.width as f64 * scale).round() as u32).max(1),
            height: ((self.height as f64 * scale).round() as u32).max(1),
        }
    }
}

/// Facts read from a produced image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub dimensions: Dimensions,
    pub mime: String,
    pub size: u64,
}

/// Watermark sizing relative to the target image width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub width_ratio: f64,
    pub margin_ratio: f64,
    pub anchor: Anchor,
}

/// Where and how large a watermark lands on a specific target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkGeometry {
    pub width: u32,
    pub height: u32,
    pub x: i64,
    pub y: i64,
}

impl Placement {
    /// Scales the mark to `width_ratio` of the target width (aspect
    /// preserved) and offsets it by `margin_ratio` of the target width from
    /// the anchored corner. `None` when the mark would be zero pixels wide.
    pub fn resolve(&self, target: Dimensions, mark: Dimensions) -> Option<WatermarkGeometry> {
        if mark.width == 0 || mark.height == 0 {
            return None;
        }
        let width = (target.width as f64 * self.width_ratio).floor() as u32;
        if width == 0 {
            return None;
        }
        let height =
            ((mark.height as f64 * width as f64 / mark.width as f64).round() as u32).max(1);
        let margin = (target.width as f64 * self.margin_ratio).floor() as i64;

        let right = target.width as i64 - width as i64 - margin;
        let bottom = target.height as i64 - height as i64 - margin;
        let (x, y) = match self.anchor {
            Anchor::TopLeft => (margin, margin),
            Anchor::TopRight => (right, margin),
            Anchor::BottomLeft => (margin, bottom),
            Anchor::BottomRight => (right, bottom),
        };

        Some(WatermarkGeometry {
            width,
            height,
            x,
            y,
        })
    }
}

/// Raster and metadata operations. Every call receives a [`Deadline`];
/// implementations must give up with `TimedOut` or `Cancelled` rather than
/// block past it.
pub trait ImageToolkit: Send + Sync {
    /// Removes all embedded metadata from the file in place.
    fn strip_metadata(&self, path: &Path, deadline: &Deadline) -> Result<(), ToolkitError>;

    /// Re-encodes `src` as PNG at `dst`. `src` and `dst` may be the same path.
    fn normalize(&self, src: &Path, dst: &Path, deadline: &Deadline) -> Result<(), ToolkitError>;

    /// Composites `watermark` onto `target` in place.
    fn composite(
        &self,
        target: &Path,
        watermark: &Path,
        placement: &Placement,
        deadline: &Deadline,
    ) -> Result<(), ToolkitError>;

    /// Writes a copy of `src` at `dst`, resized to fit a `max_edge` square.
    fn resize(
        &self,
        src: &Path,
        dst: &Path,
        max_edge: u32,
        deadline: &Deadline,
    ) -> Result<(), ToolkitError>;

    fn measure(&self, path: &Path, deadline: &Deadline) -> Result<ImageInfo, ToolkitError>;

    /// Writes tags into the file in place. Keys are group-qualified
    /// (`XMP-dc:Title`).
    fn write_tags(&self, path: &Path, tags: &TagSet, deadline: &Deadline)
        -> Result<(), ToolkitError>;

    /// Reads every tag, keyed by unqualified name (`Title`).
    fn read_tags(&self, path: &Path, deadline: &Deadline) -> Result<TagSet, ToolkitError>;
}
