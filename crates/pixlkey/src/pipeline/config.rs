use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, EmbedPolicy};
use crate::toolkit::Placement;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub processed_directory: PathBuf,
    pub allowed_extensions: Vec<String>,
    pub max_upload_bytes: u64,
    pub thumbnail_size: u32,
    pub preview_size: u32,
    pub signed_placement: Placement,
    pub derivative_placement: Placement,
    pub saved_watermark: Option<PathBuf>,
    pub default_licence: String,
    pub exiftool_path: PathBuf,
    pub stage_timeout: Duration,
    pub embed_policy: EmbedPolicy,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        let watermark = &config.watermark;
        Self {
            processed_directory: config.processed_directory.clone(),
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            max_upload_bytes: config.max_upload_bytes,
            thumbnail_size: config.renditions.thumbnail_size,
            preview_size: config.renditions.preview_size,
            signed_placement: Placement {
                width_ratio: watermark.signed_ratio,
                margin_ratio: watermark.signed_margin_ratio,
                anchor: watermark.anchor,
            },
            derivative_placement: Placement {
                width_ratio: watermark.derivative_ratio,
                margin_ratio: watermark.derivative_margin_ratio,
                anchor: watermark.anchor,
            },
            saved_watermark: watermark.saved_path.clone(),
            default_licence: config.default_licence.clone(),
            exiftool_path: config.tools.exiftool_path.clone(),
            stage_timeout: Duration::from_secs(config.tools.stage_timeout_secs),
            embed_policy: config.metadata_embed_policy,
        }
    }

    /// Default settings rooted at `processed_directory`.
    pub fn with_processed_directory<P: Into<PathBuf>>(processed_directory: P) -> Self {
        let mut config = Self::from_config(&Config::default());
        config.processed_directory = processed_directory.into();
        config
    }

    pub fn accepts_extension(&self, extension: &str) -> bool {
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed == extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolkit::Anchor;

    #[test]
    fn test_from_default_config() {
        let config = PipelineConfig::with_processed_directory("/p");
        assert_eq!(config.processed_directory, PathBuf::from("/p"));
        assert_eq!(config.signed_placement.width_ratio, 0.10);
        assert_eq!(config.derivative_placement.margin_ratio, 0.01);
        assert_eq!(config.signed_placement.anchor, Anchor::BottomRight);
        assert_eq!(config.stage_timeout, Duration::from_secs(120));
        assert_eq!(config.embed_policy, EmbedPolicy::Fatal);
    }

    #[test]
    fn test_accepts_extension() {
        let config = PipelineConfig::with_processed_directory("/p");
        assert!(config.accepts_extension("jpeg"));
        assert!(config.accepts_extension("webp"));
        assert!(!config.accepts_extension("gif"));
        assert!(!config.accepts_extension(""));
    }
}
