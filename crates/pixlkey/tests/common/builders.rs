//! Builders for submissions and uploads.

#![allow(dead_code)]

use pixlkey::{MetadataFields, MemoryToolkit, RunRequest, SubmissionContext, Upload};

pub const OWNER: &str = "owner-a";
pub const OTHER_OWNER: &str = "owner-b";

/// A fully populated, valid set of descriptive fields.
pub fn fields() -> MetadataFields {
    MetadataFields {
        title: "Sunset".to_string(),
        description: "Warm evening light over the bay".to_string(),
        seo_headline: "Sunset over the bay".to_string(),
        creation_date: "2024-03-15".to_string(),
        byline_name: "Ada Lovelace".to_string(),
        copyright_notice: "(c) 2024 Ada Lovelace".to_string(),
        creator: "Ada Lovelace".to_string(),
        position: "Painter".to_string(),
        web_statement: "https://example.org/rights".to_string(),
        keywords: "sun, sea".to_string(),
        genre: "Landscape".to_string(),
        overlay_text: String::new(),
    }
}

pub fn fields_with_keywords(keywords: &str) -> MetadataFields {
    MetadataFields {
        keywords: keywords.to_string(),
        ..fields()
    }
}

/// A 1200x900 JPEG upload.
pub fn image(name: &str) -> Upload {
    sized_image(name, 1200, 900)
}

pub fn sized_image(name: &str, width: u32, height: u32) -> Upload {
    Upload::new(name, MemoryToolkit::image_bytes("jpeg", width, height))
}

pub fn request(owner_id: &str, names: &[&str]) -> RunRequest {
    RunRequest::new(owner_id, names.iter().map(|n| image(n)).collect(), fields())
        .with_submission(SubmissionContext::new("203.0.113.7"))
}
