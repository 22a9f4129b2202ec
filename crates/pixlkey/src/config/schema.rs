use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::toolkit::Anchor;

pub const DEFAULT_LICENCE: &str = "Sold for personal use and enjoyment only.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default = "default_processed_directory")]
    pub processed_directory: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    #[serde(default)]
    pub renditions: RenditionConfig,
    #[serde(default)]
    pub watermark: WatermarkConfig,
    #[serde(default = "default_licence")]
    pub default_licence: String,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub metadata_embed_policy: EmbedPolicy,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn pixlkey_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pixlkey")
}

fn default_processed_directory() -> PathBuf {
    pixlkey_home().join("processed")
}

fn default_database_path() -> PathBuf {
    pixlkey_home().join("data").join("pixlkey.db")
}

fn default_allowed_extensions() -> Vec<String> {
    ["png", "jpg", "jpeg", "webp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_upload_bytes() -> u64 {
    200 * 1024 * 1024
}

fn default_licence() -> String {
    DEFAULT_LICENCE.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            processed_directory: default_processed_directory(),
            database_path: default_database_path(),
            allowed_extensions: default_allowed_extensions(),
            max_upload_bytes: default_max_upload_bytes(),
            renditions: RenditionConfig::default(),
            watermark: WatermarkConfig::default(),
            default_licence: default_licence(),
            tools: ToolsConfig::default(),
            metadata_embed_policy: EmbedPolicy::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Longest-edge sizes of the derivative renditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenditionConfig {
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
    #[serde(default = "default_preview_size")]
    pub preview_size: u32,
}

fn default_thumbnail_size() -> u32 {
    400
}

fn default_preview_size() -> u32 {
    800
}

impl Default for RenditionConfig {
    fn default() -> Self {
        Self {
            thumbnail_size: default_thumbnail_size(),
            preview_size: default_preview_size(),
        }
    }
}

/// Watermark sizes and margins as fractions of the target image width.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkConfig {
    #[serde(default = "default_signed_ratio")]
    pub signed_ratio: f64,
    #[serde(default = "default_signed_margin_ratio")]
    pub signed_margin_ratio: f64,
    #[serde(default = "default_derivative_ratio")]
    pub derivative_ratio: f64,
    #[serde(default = "default_derivative_margin_ratio")]
    pub derivative_margin_ratio: f64,
    #[serde(default)]
    pub anchor: Anchor,
    /// Saved watermark used when a run does not upload one.
    #[serde(default)]
    pub saved_path: Option<PathBuf>,
}

fn default_signed_ratio() -> f64 {
    0.10
}

fn default_signed_margin_ratio() -> f64 {
    0.02
}

fn default_derivative_ratio() -> f64 {
    0.06
}

fn default_derivative_margin_ratio() -> f64 {
    0.01
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            signed_ratio: default_signed_ratio(),
            signed_margin_ratio: default_signed_margin_ratio(),
            derivative_ratio: default_derivative_ratio(),
            derivative_margin_ratio: default_derivative_margin_ratio(),
            anchor: Anchor::default(),
            saved_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_exiftool_path")]
    pub exiftool_path: PathBuf,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

fn default_exiftool_path() -> PathBuf {
    PathBuf::from("exiftool")
}

fn default_stage_timeout_secs() -> u64 {
    120
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            exiftool_path: default_exiftool_path(),
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

/// What a metadata embed failure does to the file being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbedPolicy {
    /// The file is dropped from the run.
    #[default]
    Fatal,
    /// The file continues unembedded; the failure is reported as an event.
    Lenient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate_limit")]
    pub limit: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_rate_limit() -> u32 {
    10
}

fn default_window_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: default_rate_limit(),
            window_secs: default_window_secs(),
        }
    }
}
