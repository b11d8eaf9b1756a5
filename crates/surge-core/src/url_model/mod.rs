//! URL modelling and filename derivation.
//!
//! Derives safe local filenames from a caller hint, a Content-Disposition
//! header, or the URL path tail, sanitized for Linux filesystems; resolves
//! collisions with `name(N).ext` counters; parses comma-separated mirror
//! lists.

mod content_disposition;
mod path;
mod sanitize;
mod unique;

pub use content_disposition::parse_content_disposition_filename;
pub use path::{dir_segments_from_url, filename_from_url_path};
pub use sanitize::sanitize_filename;
pub use unique::{numbered_name, unique_destination, MAX_NAME_ATTEMPTS};

/// Default filename when every other source yields nothing usable.
pub const DEFAULT_FILENAME: &str = "download.bin";

/// Derives a filename for saving a download.
///
/// Priority: caller hint → `Content-Disposition` → URL path tail →
/// [`DEFAULT_FILENAME`]. The winner is sanitized; an unusable result falls
/// through to the next source.
pub fn derive_filename(
    hint: Option<&str>,
    url: &str,
    content_disposition: Option<&str>,
) -> String {
    let candidates = [
        hint.map(str::to_string),
        content_disposition.and_then(parse_content_disposition_filename),
        filename_from_url_path(url),
    ];
    for candidate in candidates.into_iter().flatten() {
        let sanitized = sanitize_filename(&candidate);
        if !sanitized.is_empty() {
            return sanitized;
        }
    }
    DEFAULT_FILENAME.to_string()
}

/// Splits a comma-separated URL argument (`primary,mirror1,mirror2`) into
/// `(primary, mirrors)`. Whitespace around commas is trimmed; empty entries
/// are dropped. Returns `None` for an input with no usable URL. The primary
/// is part of the mirror rotation by construction, so `mirrors` holds only
/// the alternates.
pub fn parse_url_list(arg: &str) -> Option<(String, Vec<String>)> {
    let mut urls = arg
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let primary = urls.next()?;
    Some((primary, urls.collect()))
}
