//! Parse probe response header lines.

/// Headers of interest from a probe response.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProbeHeaders {
    pub content_length: Option<u64>,
    /// Total size from `Content-Range: bytes 0-0/N`; `None` for `*`.
    pub content_range_total: Option<u64>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

/// Parse collected header lines (final hop only) into [`ProbeHeaders`].
pub(crate) fn parse_headers(lines: &[String]) -> ProbeHeaders {
    let mut out = ProbeHeaders::default();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            out.content_length = value.parse::<u64>().ok();
        } else if name.eq_ignore_ascii_case("content-range") {
            out.content_range_total = parse_content_range_total(value);
        } else if name.eq_ignore_ascii_case("content-type") {
            out.content_type = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-disposition") {
            out.content_disposition = Some(value.to_string());
        }
    }
    out
}

/// Total size from a `Content-Range` value: the part after the last `/`.
/// `*` (unknown) and unparsable totals yield `None`.
pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?.trim();
    if total == "*" {
        return None;
    }
    total.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total_variants() {
        assert_eq!(parse_content_range_total("bytes 0-0/1048576"), Some(1_048_576));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("bytes */2000"), Some(2000));
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn parse_headers_picks_fields() {
        let lines = [
            "HTTP/1.1 206 Partial Content".to_string(),
            "Content-Range: bytes 0-0/5000".to_string(),
            "Content-Type: application/octet-stream".to_string(),
            "content-disposition: attachment; filename=\"x.bin\"".to_string(),
        ];
        let h = parse_headers(&lines);
        assert_eq!(h.content_range_total, Some(5000));
        assert_eq!(h.content_type.as_deref(), Some("application/octet-stream"));
        assert!(h.content_disposition.as_deref().unwrap().contains("x.bin"));
        assert_eq!(h.content_length, None);
    }

    #[test]
    fn parse_headers_content_length() {
        let lines = [
            "HTTP/1.1 200 OK".to_string(),
            "Content-Length: 777".to_string(),
        ];
        let h = parse_headers(&lines);
        assert_eq!(h.content_length, Some(777));
    }
}
