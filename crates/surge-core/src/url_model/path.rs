//! Filename and directory extraction from URL paths.

use super::sanitize_filename;

/// Extracts the last path segment of a URL as a filename candidate.
///
/// Returns `None` when the URL doesn't parse or the path is empty/root.
pub fn filename_from_url_path(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .last()?;
    if segment == "." || segment == ".." {
        return None;
    }
    Some(segment.to_string())
}

/// Directory segments of the URL path (everything but the last segment),
/// sanitized for use under the output directory. Used when the
/// preserve-URL-path option mirrors the remote layout locally.
pub fn dir_segments_from_url(url: &str) -> Vec<String> {
    let Ok(parsed) = url::Url::parse(url) else {
        return Vec::new();
    };
    let segments: Vec<&str> = parsed
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    if segments.len() < 2 {
        return Vec::new();
    }
    segments[..segments.len() - 1]
        .iter()
        .map(|s| sanitize_filename(s))
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_segment() {
        assert_eq!(
            filename_from_url_path("https://example.com/a/b/file.iso").as_deref(),
            Some("file.iso")
        );
        assert_eq!(
            filename_from_url_path("https://example.com/single").as_deref(),
            Some("single")
        );
    }

    #[test]
    fn root_or_empty() {
        assert_eq!(filename_from_url_path("https://example.com/"), None);
        assert_eq!(filename_from_url_path("https://example.com"), None);
    }

    #[test]
    fn query_ignored() {
        assert_eq!(
            filename_from_url_path("https://example.com/file.zip?token=abc").as_deref(),
            Some("file.zip")
        );
    }

    #[test]
    fn dir_segments() {
        assert_eq!(
            dir_segments_from_url("https://example.com/pub/linux/file.iso"),
            vec!["pub", "linux"]
        );
        assert!(dir_segments_from_url("https://example.com/file.iso").is_empty());
        assert!(dir_segments_from_url("https://example.com/").is_empty());
    }
}
