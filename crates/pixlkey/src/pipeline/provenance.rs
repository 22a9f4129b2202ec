//! Provenance tags written into the signed image, and the Markdown
//! metadata document rendered from what is read back out of it.

use crate::fingerprint::Fingerprint;
use crate::submission::MetadataFields;
use crate::toolkit::TagSet;

/// Tag name under which the pre-embed identifier is read back.
pub const DOCUMENT_ID_TAG: &str = "DocumentID";

/// Builds the group-qualified tag set for one file. Empty optional fields
/// are omitted; identifiers and the rights marker are always present.
pub fn provenance_tags(fields: &MetadataFields, licence: &str, pre_embed: &Fingerprint) -> TagSet {
    let document_id = pre_embed.document_id();
    let mut tags = TagSet::new();
    let mut put = |key: &str, value: &str| {
        if !value.is_empty() {
            tags.insert(key.to_string(), value.to_string());
        }
    };

    put("IPTC:By-line", &fields.byline_name);
    put("IPTC:CopyrightNotice", &fields.copyright_notice);
    put("XMP-dc:Creator", &fields.creator);
    put("XMP-dc:Rights", &fields.copyright_notice);
    put("XMP-photoshop:AuthorsPosition", &fields.position);
    put("XMP-xmpRights:Marked", "true");
    put("XMP-xmpRights:WebStatement", &fields.web_statement);
    put("XMP-xmpRights:UsageTerms", licence);
    put("XMP-dc:Title", &fields.title);
    put("XMP-dc:Description", &fields.description);
    put("XMP-dc:Date", &fields.creation_date);
    put("XMP-photoshop:Headline", &fields.seo_headline);
    put("XMP-dc:Subject", &fields.keywords);
    put("XMP-iptcCore:IntellectualGenre", &fields.genre);
    put("XMP-xmpMM:DocumentID", &document_id);
    put("XMP-xmpMM:InstanceID", &document_id);

    tags
}

/// Tags never rendered: file system facts and the raw rights field.
const EXCLUDED_FIELDS: &[&str] = &[
    "FileName",
    "Directory",
    "FileInode",
    "FilePermissions",
    "FileModificationDate",
    "FileAccessDate",
    "FileCreateDate",
    "FileTypeExtension",
    "FileSize",
    "FileType",
    "MIMEType",
    "ImageSize",
    "Megapixels",
    "SourceFile",
    "FileInodeChangeDate",
    "Rights",
];

const FIELD_LABELS: &[(&str, &str)] = &[
    ("ExifToolVersionNumber", "ExifTool Version"),
    ("ImageWidth", "Image Width"),
    ("ImageHeight", "Image Height"),
    ("BitDepth", "Bit Depth"),
    ("ColorType", "Color Type"),
    ("WhitePointX", "White Point X"),
    ("WhitePointY", "White Point Y"),
    ("RedX", "Red X"),
    ("RedY", "Red Y"),
    ("GreenX", "Green X"),
    ("GreenY", "Green Y"),
    ("BlueX", "Blue X"),
    ("BlueY", "Blue Y"),
    ("BackgroundColor", "Background Color"),
    ("ModifyDate", "Modify Date"),
    ("CopyrightNotice", "Copyright Notice"),
    ("IntellectualGenre", "Intellectual Genre"),
    ("Date", "Creation Date"),
    ("AuthorsPosition", "Author's Position"),
    ("DocumentID", "Document ID"),
    ("InstanceID", "Instance ID"),
    ("WebStatement", "Web Statement"),
];

const SECTIONS: &[(&str, &[&str])] = &[
    (
        "Basic Information",
        &[
            "Title",
            "Creator",
            "Creation Date",
            "Description",
            "Intellectual Genre",
            "Subject",
            "Web Statement",
        ],
    ),
    (
        "Technical Details",
        &[
            "Image Width",
            "Image Height",
            "Bit Depth",
            "Color Type",
            "Compression",
            "Filter",
            "Interlace",
            "White Point X",
            "White Point Y",
            "Red X",
            "Red Y",
            "Green X",
            "Green Y",
            "Blue X",
            "Blue Y",
            "Background Color",
            "Modify Date",
        ],
    ),
    ("Metadata Identifiers", &["Document ID", "Instance ID", "Marked"]),
    (
        "Additional Information",
        &["By-line", "Copyright Notice", "Author's Position", "Headline"],
    ),
];

fn label_for(key: &str) -> &str {
    FIELD_LABELS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, label)| *label)
        .unwrap_or(key)
}

/// HTML-escapes a value and flattens it onto one table row.
fn cell(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            '|' => out.push_str("\\|"),
            '\n' | '\r' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}

/// Renders the metadata document. Only fields belonging to a section are
/// written; each section keeps its fixed field order.
pub fn render_metadata_document(tags: &TagSet) -> String {
    let labelled: Vec<(&str, &str)> = tags
        .iter()
        .filter(|(key, _)| !EXCLUDED_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (label_for(key), value.as_str()))
        .collect();

    let mut doc = String::from("# Digital Metadata for Artwork\n\n");
    for (title, fields) in SECTIONS {
        doc.push_str(&format!("## {}\n\n", title));
        doc.push_str("| **Field** | **Value** |\n");
        doc.push_str("|-----------|-----------|\n");
        for field in fields.iter() {
            if let Some((_, value)) = labelled.iter().find(|(label, _)| label == field) {
                let mut value = cell(value);
                if *field == "Description" {
                    value = format!("> {}", value);
                }
                doc.push_str(&format!("| {} | {} |\n", field, value));
            }
        }
        doc.push('\n');
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_bytes;

    fn fields() -> MetadataFields {
        MetadataFields {
            title: "Sunset".to_string(),
            description: "Warm light\nover water".to_string(),
            creation_date: "2024-03-15".to_string(),
            byline_name: "Ada".to_string(),
            copyright_notice: "(c) 2024 Ada".to_string(),
            creator: "Ada Lovelace".to_string(),
            keywords: "sun, sea".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_provenance_tags_identifiers_and_licence() {
        let pre = fingerprint_bytes(b"pixels");
        let tags = provenance_tags(&fields(), "CC BY 4.0", &pre);
        let id = format!("uuid:{}", pre);
        assert_eq!(tags["XMP-xmpMM:DocumentID"], id);
        assert_eq!(tags["XMP-xmpMM:InstanceID"], id);
        assert_eq!(tags["XMP-xmpRights:UsageTerms"], "CC BY 4.0");
        assert_eq!(tags["XMP-xmpRights:Marked"], "true");
        assert_eq!(tags["XMP-dc:Rights"], "(c) 2024 Ada");
        assert_eq!(tags["XMP-dc:Subject"], "sun, sea");
    }

    #[test]
    fn test_provenance_tags_skip_empty_fields() {
        let tags = provenance_tags(&fields(), "L", &fingerprint_bytes(b"x"));
        assert!(!tags.contains_key("XMP-photoshop:Headline"));
        assert!(!tags.contains_key("XMP-photoshop:AuthorsPosition"));
    }

    fn read_back() -> TagSet {
        [
            ("SourceFile", "/srv/processed/u1/r/a_signed.png"),
            ("FileName", "a_signed.png"),
            ("Directory", "/srv/processed/u1/r"),
            ("FileType", "PNG"),
            ("MIMEType", "image/png"),
            ("Title", "Sunset"),
            ("Creator", "Ada Lovelace"),
            ("Date", "2024-03-15"),
            ("Description", "Warm light\nover water"),
            ("Rights", "(c) 2024 Ada"),
            ("ImageWidth", "640"),
            ("DocumentID", "uuid:abc"),
            ("Marked", "true"),
            ("By-line", "Ada"),
            ("CopyrightNotice", "<b>(c)</b> | Ada"),
            ("UsageTerms", "CC BY 4.0"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_document_sections_and_rows() {
        let doc = render_metadata_document(&read_back());
        assert!(doc.starts_with("# Digital Metadata for Artwork\n\n## Basic Information\n\n"));
        assert!(doc.contains("| **Field** | **Value** |\n|-----------|-----------|\n"));
        assert!(doc.contains("| Title | Sunset |\n"));
        assert!(doc.contains("| Creation Date | 2024-03-15 |\n"));
        assert!(doc.contains("| Description | > Warm light over water |\n"));
        assert!(doc.contains("| Image Width | 640 |\n"));
        assert!(doc.contains("| Document ID | uuid:abc |\n"));
        assert!(doc.contains("| Marked | true |\n"));
        assert!(doc.contains("## Additional Information"));
    }

    #[test]
    fn test_document_excludes_file_facts_and_unsectioned() {
        let doc = render_metadata_document(&read_back());
        assert!(!doc.contains("a_signed.png"));
        assert!(!doc.contains("/srv/processed"));
        assert!(!doc.contains("| Rights |"));
        assert!(!doc.contains("File Type"));
        assert!(!doc.contains("image/png"));
        assert!(!doc.contains("UsageTerms"));
    }

    #[test]
    fn test_no_section_field_comes_from_an_excluded_tag() {
        for excluded in EXCLUDED_FIELDS {
            let label = label_for(excluded);
            for (title, fields) in SECTIONS {
                assert!(
                    !fields.contains(&label),
                    "{} lists {} which is never rendered",
                    title,
                    label
                );
            }
        }
    }

    #[test]
    fn test_document_escapes_values() {
        let doc = render_metadata_document(&read_back());
        assert!(doc.contains("| Copyright Notice | &lt;b&gt;(c)&lt;/b&gt; \\| Ada |\n"));
    }

    #[test]
    fn test_title_precedes_creator_regardless_of_tag_order() {
        let doc = render_metadata_document(&read_back());
        let title = doc.find("| Title |").unwrap();
        let creator = doc.find("| Creator |").unwrap();
        assert!(title < creator);
    }
}
