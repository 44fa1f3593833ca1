//! Object key generation.

use std::path::Path;

/// Longest file stem kept in a generated key, in characters.
pub const MAX_STEM_CHARS: usize = 200;

/// Object key for an uploaded file: `{stem[..200]}-{unique_id}{.ext}`.
///
/// `unique_id` is the upload job's id, so every attempt of one job writes the
/// same object. Directory components are dropped and only ASCII
/// alphanumerics and `-` of the id are kept, so neither part can address
/// another prefix.
pub fn generate_object_key(file_name: &str, unique_id: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);
    let path = Path::new(base);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let stem: String = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .chars()
        .take(MAX_STEM_CHARS)
        .collect();

    let unique: String = unique_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();

    format!("{}-{}{}", stem, unique, ext)
}
