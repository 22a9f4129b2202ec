//! Production toolkit: raster work through the `image` crate, metadata
//! through an ExifTool subprocess.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, ImageReader};
use tracing::{debug, warn};

use super::{Deadline, Dimensions, ImageInfo, ImageToolkit, Placement, TagSet, ToolkitError};
use crate::sanitize;

const EXIFTOOL: &str = "exiftool";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct StandardToolkit {
    exiftool: PathBuf,
}

impl StandardToolkit {
    pub fn new<P: AsRef<Path>>(exiftool: P) -> Self {
        Self {
            exiftool: exiftool.as_ref().to_path_buf(),
        }
    }

    fn open(&self, path: &Path) -> Result<DynamicImage, ToolkitError> {
        ImageReader::open(path)
            .map_err(|e| ToolkitError::io(path, e))?
            .with_guessed_format()
            .map_err(|e| ToolkitError::io(path, e))?
            .decode()
            .map_err(|e| ToolkitError::Decode {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    /// Encodes to a sibling temp file and renames it over `dst`, so `dst`
    /// may also be the source being read.
    fn save_png(&self, image: &DynamicImage, dst: &Path) -> Result<(), ToolkitError> {
        let tmp = dst.with_extension("png.partial");
        image
            .save_with_format(&tmp, ImageFormat::Png)
            .map_err(|e| {
                let _ = fs::remove_file(&tmp);
                ToolkitError::Encode {
                    path: dst.to_path_buf(),
                    reason: e.to_string(),
                }
            })?;
        fs::rename(&tmp, dst).map_err(|e| ToolkitError::io(dst, e))
    }

    /// Runs ExifTool, killing it once the deadline passes.
    fn run_exiftool(
        &self,
        args: &[String],
        operation: &'static str,
        deadline: &Deadline,
    ) -> Result<Vec<u8>, ToolkitError> {
        deadline.check(operation)?;

        let mut child = Command::new(&self.exiftool)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ToolkitError::Spawn {
                tool: EXIFTOOL.to_string(),
                source: e,
            })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if let Err(e) = deadline.check(operation) {
                        let _ = child.kill();
                        let _ = child.wait();
                        warn!(operation, "Killed exiftool after deadline");
                        return Err(e);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(ToolkitError::Spawn {
                        tool: EXIFTOOL.to_string(),
                        source: e,
                    })
                }
            }
        };

        let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

        if !status.success() {
            return Err(ToolkitError::Tool {
                tool: EXIFTOOL.to_string(),
                status: status.code(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Flattens one ExifTool JSON value to display text.
fn json_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(json_to_text)
            .collect::<Vec<_>>()
            .join(", "),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parses `exiftool -j` output for a single file.
pub(crate) fn parse_exiftool_json(raw: &[u8]) -> Result<TagSet, ToolkitError> {
    let parsed: Vec<serde_json::Map<String, serde_json::Value>> =
        serde_json::from_slice(raw).map_err(|e| ToolkitError::Output {
            tool: EXIFTOOL.to_string(),
            reason: e.to_string(),
        })?;
    let first = parsed.into_iter().next().ok_or_else(|| ToolkitError::Output {
        tool: EXIFTOOL.to_string(),
        reason: "empty result".to_string(),
    })?;
    Ok(first
        .iter()
        .map(|(key, value)| (key.clone(), json_to_text(value)))
        .collect())
}

impl ImageToolkit for StandardToolkit {
    fn strip_metadata(&self, path: &Path, deadline: &Deadline) -> Result<(), ToolkitError> {
        let args = vec![
            "-overwrite_original".to_string(),
            "-all=".to_string(),
            path_arg(path),
        ];
        self.run_exiftool(&args, "strip_metadata", deadline)?;
        Ok(())
    }

    fn normalize(&self, src: &Path, dst: &Path, deadline: &Deadline) -> Result<(), ToolkitError> {
        deadline.check("normalize")?;
        let image = self.open(src)?;
        deadline.check("normalize")?;
        self.save_png(&image, dst)?;
        debug!(file = %sanitize::redact_path(dst), "Normalized to PNG");
        Ok(())
    }

    fn composite(
        &self,
        target: &Path,
        watermark: &Path,
        placement: &Placement,
        deadline: &Deadline,
    ) -> Result<(), ToolkitError> {
        deadline.check("composite")?;
        let base = self.open(target)?;
        let mark = self.open(watermark)?;

        let geometry = match placement.resolve(
            Dimensions::new(base.width(), base.height()),
            Dimensions::new(mark.width(), mark.height()),
        ) {
            Some(g) => g,
            None => {
                debug!(file = %sanitize::redact_path(target), "Target too small for watermark");
                return Ok(());
            }
        };

        let scaled = mark
            .resize_exact(geometry.width, geometry.height, FilterType::Lanczos3)
            .to_rgba8();
        let mut canvas = base.to_rgba8();
        imageops::overlay(&mut canvas, &scaled, geometry.x, geometry.y);

        deadline.check("composite")?;
        self.save_png(&DynamicImage::ImageRgba8(canvas), target)
    }

    fn resize(
        &self,
        src: &Path,
        dst: &Path,
        max_edge: u32,
        deadline: &Deadline,
    ) -> Result<(), ToolkitError> {
        deadline.check("resize")?;
        let image = self.open(src)?;
        let fitted = Dimensions::new(image.width(), image.height()).fit_within(max_edge);
        let resized = image.resize_exact(fitted.width, fitted.height, FilterType::Lanczos3);
        deadline.check("resize")?;
        self.save_png(&resized, dst)
    }

    fn measure(&self, path: &Path, deadline: &Deadline) -> Result<ImageInfo, ToolkitError> {
        deadline.check("measure")?;
        let size = fs::metadata(path)
            .map_err(|e| ToolkitError::io(path, e))?
            .len();
        let reader = ImageReader::open(path)
            .map_err(|e| ToolkitError::io(path, e))?
            .with_guessed_format()
            .map_err(|e| ToolkitError::io(path, e))?;
        let mime = match reader.format() {
            Some(format) => format.to_mime_type().to_string(),
            None => mime_guess::from_path(path)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        };
        let (width, height) = reader.into_dimensions().map_err(|e| ToolkitError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(ImageInfo {
            dimensions: Dimensions::new(width, height),
            mime,
            size,
        })
    }

    fn write_tags(
        &self,
        path: &Path,
        tags: &TagSet,
        deadline: &Deadline,
    ) -> Result<(), ToolkitError> {
        let mut args = vec!["-overwrite_original".to_string(), "-charset".to_string(), "utf8".to_string()];
        args.extend(tags.iter().map(|(key, value)| format!("-{}={}", key, value)));
        args.push(path_arg(path));
        self.run_exiftool(&args, "write_tags", deadline)?;
        Ok(())
    }

    fn read_tags(&self, path: &Path, deadline: &Deadline) -> Result<TagSet, ToolkitError> {
        let args = vec!["-j".to_string(), path_arg(path)];
        let output = self.run_exiftool(&args, "read_tags", deadline)?;
        parse_exiftool_json(&output)
    }
}
