//! Helpers for sanitizing client-supplied names and for keeping server
//! paths out of progress events and tracing span attributes.

use std::path::Path;

/// Archive base name used when a run holds more than one file.
pub const MULTI_FILE_ARCHIVE_NAME: &str = "final_assets";

/// Replaces every character outside `[A-Za-z0-9_-]` with `_`.
///
/// Idempotent: `sanitize_basename(sanitize_basename(x)) == sanitize_basename(x)`.
pub fn sanitize_basename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Sanitized stem of a client-supplied file name (directories and the
/// last extension removed). Returns `None` when nothing usable remains.
pub fn sanitized_stem(original_name: &str) -> Option<String> {
    let stem = Path::new(original_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    let sanitized = sanitize_basename(stem);
    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized)
    }
}

/// Lowercased extension of a client-supplied file name.
pub fn extension_of(original_name: &str) -> String {
    Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Archive base name: the sanitized stem for a single file, otherwise
/// [`MULTI_FILE_ARCHIVE_NAME`].
pub fn archive_base_name(original_names: &[&str]) -> String {
    match original_names {
        [single] => {
            sanitized_stem(single).unwrap_or_else(|| MULTI_FILE_ARCHIVE_NAME.to_string())
        }
        _ => MULTI_FILE_ARCHIVE_NAME.to_string(),
    }
}

/// Returns only the filename component of a path (no directory).
///
/// Safe for span fields: reveals the file name, never the full path.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Client-facing form of a path under the processed root:
/// `/srv/data/processed/u1/run/a.png` becomes `.../processed/u1/run/a.png`.
/// Paths outside the root collapse to their file name.
pub fn display_path(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(relative) => format!(".../processed/{}", relative.display()),
        Err(_) => redact_path(path),
    }
}

/// Rewrites any occurrence of `root` inside free text (error messages from
/// I/O or external tools) to the `.../processed` placeholder.
pub fn redact_text(root: &Path, text: &str) -> String {
    let root = root.to_string_lossy();
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return text.to_string();
    }
    text.replace(root, ".../processed")
}
