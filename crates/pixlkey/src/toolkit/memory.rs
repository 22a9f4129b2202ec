//! Deterministic toolkit fake.
//!
//! Images are small text documents (`FAKEIMG <format> <w>x<h>` followed by
//! `mark`, `meta` and `tag` lines) written to real files, so hashing,
//! archiving and committing behave exactly as in production. Every call is
//! recorded, and failures or delays can be injected per operation for file
//! names containing a given fragment.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use super::{Deadline, Dimensions, ImageInfo, ImageToolkit, Placement, TagSet, ToolkitError};

const HEADER: &str = "FAKEIMG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    StripMetadata,
    Normalize,
    Composite,
    Resize,
    Measure,
    WriteTags,
    ReadTags,
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::StripMetadata => "strip_metadata",
            Operation::Normalize => "normalize",
            Operation::Composite => "composite",
            Operation::Resize => "resize",
            Operation::Measure => "measure",
            Operation::WriteTags => "write_tags",
            Operation::ReadTags => "read_tags",
        }
    }
}

/// Parsed form of a fake image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeImage {
    pub format: String,
    pub dimensions: Dimensions,
    pub marks: Vec<String>,
    pub meta: Vec<String>,
    pub tags: TagSet,
}

impl FakeImage {
    pub fn new(format: &str, width: u32, height: u32) -> Self {
        Self {
            format: format.to_string(),
            dimensions: Dimensions::new(width, height),
            marks: Vec::new(),
            meta: Vec::new(),
            tags: TagSet::new(),
        }
    }

    /// Adds an uploader metadata line that stripping must remove.
    pub fn with_meta(mut self, line: &str) -> Self {
        self.meta.push(line.to_string());
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}x{}\n",
            HEADER, self.format, self.dimensions.width, self.dimensions.height
        );
        for mark in &self.marks {
            out.push_str(&format!("mark {}\n", mark));
        }
        for meta in &self.meta {
            out.push_str(&format!("meta {}\n", meta));
        }
        for (key, value) in &self.tags {
            out.push_str(&format!("tag {}={}\n", key, value.replace('\n', " ")));
        }
        out.into_bytes()
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        let mut lines = text.lines();
        let mut header = lines.next()?.split_whitespace();
        if header.next()? != HEADER {
            return None;
        }
        let format = header.next()?.to_string();
        let (w, h) = header.next()?.split_once('x')?;
        let mut image = FakeImage::new(&format, w.parse().ok()?, h.parse().ok()?);
        for line in lines {
            if let Some(mark) = line.strip_prefix("mark ") {
                image.marks.push(mark.to_string());
            } else if let Some(meta) = line.strip_prefix("meta ") {
                image.meta.push(meta.to_string());
            } else if let Some(tag) = line.strip_prefix("tag ") {
                let (key, value) = tag.split_once('=')?;
                image.tags.insert(key.to_string(), value.to_string());
            }
        }
        Some(image)
    }

    pub fn read(path: &Path) -> Option<Self> {
        fs::read(path).ok().and_then(|b| Self::parse(&b))
    }
}

#[derive(Default)]
pub struct MemoryToolkit {
    failures: HashMap<Operation, String>,
    delays: HashMap<Operation, Duration>,
    discard_tags: bool,
    tag_overrides: TagSet,
    calls: Mutex<Vec<(Operation, PathBuf)>>,
}

impl MemoryToolkit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails `operation` for any path whose file name contains `fragment`.
    pub fn failing(mut self, operation: Operation, fragment: &str) -> Self {
        self.failures.insert(operation, fragment.to_string());
        self
    }

    /// Sleeps before `operation`, then honours the deadline.
    pub fn slow(mut self, operation: Operation, delay: Duration) -> Self {
        self.delays.insert(operation, delay);
        self
    }

    /// Makes `write_tags` succeed without touching the file.
    pub fn discarding_tags(mut self) -> Self {
        self.discard_tags = true;
        self
    }

    /// Reports `value` for `key` from every `read_tags`, whatever the
    /// file holds.
    pub fn overriding_tag(mut self, key: &str, value: &str) -> Self {
        self.tag_overrides.insert(key.to_string(), value.to_string());
        self
    }

    /// Bytes of a fresh fake upload.
    pub fn image_bytes(format: &str, width: u32, height: u32) -> Vec<u8> {
        FakeImage::new(format, width, height).to_bytes()
    }

    pub fn calls(&self) -> Vec<(Operation, PathBuf)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.calls().iter().filter(|(op, _)| *op == operation).count()
    }

    fn enter(&self, operation: Operation, path: &Path, deadline: &Deadline) -> Result<(), ToolkitError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((operation, path.to_path_buf()));
        }
        deadline.check(operation.name())?;
        if let Some(delay) = self.delays.get(&operation) {
            thread::sleep(*delay);
            deadline.check(operation.name())?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match self.failures.get(&operation) {
            Some(fragment) if file_name.contains(fragment.as_str()) => Err(ToolkitError::Tool {
                tool: "memory".to_string(),
                status: Some(1),
                stderr: format!("injected {} failure", operation.name()),
            }),
            _ => Ok(()),
        }
    }

    fn load(&self, path: &Path) -> Result<FakeImage, ToolkitError> {
        let bytes = fs::read(path).map_err(|e| ToolkitError::io(path, e))?;
        FakeImage::parse(&bytes).ok_or_else(|| ToolkitError::Decode {
            path: path.to_path_buf(),
            reason: "not a fake image".to_string(),
        })
    }

    fn store(&self, image: &FakeImage, path: &Path) -> Result<(), ToolkitError> {
        fs::write(path, image.to_bytes()).map_err(|e| ToolkitError::io(path, e))
    }
}

fn mime_for(format: &str) -> String {
    mime_guess::from_ext(format)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

impl ImageToolkit for MemoryToolkit {
    fn strip_metadata(&self, path: &Path, deadline: &Deadline) -> Result<(), ToolkitError> {
        self.enter(Operation::StripMetadata, path, deadline)?;
        let mut image = self.load(path)?;
        image.meta.clear();
        image.tags.clear();
        self.store(&image, path)
    }

    fn normalize(&self, src: &Path, dst: &Path, deadline: &Deadline) -> Result<(), ToolkitError> {
        self.enter(Operation::Normalize, src, deadline)?;
        let mut image = self.load(src)?;
        image.format = "png".to_string();
        self.store(&image, dst)
    }

    fn composite(
        &self,
        target: &Path,
        watermark: &Path,
        placement: &Placement,
        deadline: &Deadline,
    ) -> Result<(), ToolkitError> {
        self.enter(Operation::Composite, target, deadline)?;
        let mut image = self.load(target)?;
        let mark = self.load(watermark)?;
        if let Some(g) = placement.resolve(image.dimensions, mark.dimensions) {
            image
                .marks
                .push(format!("{}x{}@{},{}", g.width, g.height, g.x, g.y));
        }
        self.store(&image, target)
    }

    fn resize(
        &self,
        src: &Path,
        dst: &Path,
        max_edge: u32,
        deadline: &Deadline,
    ) -> Result<(), ToolkitError> {
        self.enter(Operation::Resize, dst, deadline)?;
        let mut image = self.load(src)?;
        image.dimensions = image.dimensions.fit_within(max_edge);
        image.marks.clear();
        self.store(&image, dst)
    }

    fn measure(&self, path: &Path, deadline: &Deadline) -> Result<ImageInfo, ToolkitError> {
        self.enter(Operation::Measure, path, deadline)?;
        let size = fs::metadata(path)
            .map_err(|e| ToolkitError::io(path, e))?
            .len();
        let image = self.load(path)?;
        Ok(ImageInfo {
            dimensions: image.dimensions,
            mime: mime_for(&image.format),
            size,
        })
    }

    fn write_tags(
        &self,
        path: &Path,
        tags: &TagSet,
        deadline: &Deadline,
    ) -> Result<(), ToolkitError> {
        self.enter(Operation::WriteTags, path, deadline)?;
        if self.discard_tags {
            return Ok(());
        }
        let mut image = self.load(path)?;
        image
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.store(&image, path)
    }

    /// Returns embedded tags under their unqualified names plus the file
    /// facts ExifTool would report.
    fn read_tags(&self, path: &Path, deadline: &Deadline) -> Result<TagSet, ToolkitError> {
        self.enter(Operation::ReadTags, path, deadline)?;
        let image = self.load(path)?;
        let mut tags: TagSet = image
            .tags
            .iter()
            .map(|(key, value)| {
                let short = key.rsplit(':').next().unwrap_or(key);
                (short.to_string(), value.clone())
            })
            .collect();

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        tags.insert("SourceFile".to_string(), path.display().to_string());
        tags.insert("FileName".to_string(), file_name);
        tags.insert("Directory".to_string(), directory);
        tags.insert("FileType".to_string(), image.format.to_uppercase());
        tags.insert("MIMEType".to_string(), mime_for(&image.format));
        tags.insert("ImageWidth".to_string(), image.dimensions.width.to_string());
        tags.insert("ImageHeight".to_string(), image.dimensions.height.to_string());
        tags.extend(self.tag_overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(tags)
    }
}
