//! Server capability probing.
//!
//! Issues a `GET` with `Range: bytes=0-0` (not `HEAD`: some origins lie to
//! or reject `HEAD`) and classifies the response: `206` means byte ranges
//! work and `Content-Range` carries the total size; `200` means sequential
//! only. `403`/`405` get one retry without the `Range` header. Transport
//! failures retry the whole probe with 1 s spacing.

mod parse;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::str;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::url_model;

/// Whole-probe attempts on transport failure.
pub const PROBE_ATTEMPTS: u32 = 3;
/// Spacing between probe attempts.
const PROBE_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Per-attempt overall timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-mirror timeout used by [`probe_mirrors`].
const MIRROR_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Redirect ceiling.
const MAX_REDIRECTS: u32 = 10;

/// Probe outcome: what the origin can do and what to call the file.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Total size when the server reported one; zero and `*` map to `None`.
    pub file_size: Option<u64>,
    pub supports_range: bool,
    pub filename: String,
    pub content_type: Option<String>,
}

/// Non-transport probe failures.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("unexpected status {0}")]
    UnexpectedStatus(u32),
}

/// Probe `url`, following redirects and retrying transport failures.
///
/// Runs on the current thread; call from `spawn_blocking` in async code.
pub fn probe(
    url: &str,
    filename_hint: Option<&str>,
    custom_headers: &HashMap<String, String>,
    runtime: &RuntimeConfig,
) -> Result<ProbeResult> {
    probe_with(url, filename_hint, custom_headers, runtime, PROBE_ATTEMPTS, PROBE_TIMEOUT)
}

fn probe_with(
    url: &str,
    filename_hint: Option<&str>,
    custom_headers: &HashMap<String, String>,
    runtime: &RuntimeConfig,
    attempts: u32,
    timeout: Duration,
) -> Result<ProbeResult> {
    let mut last_err: Option<curl::Error> = None;
    for attempt in 1..=attempts {
        match issue(url, custom_headers, runtime, true, timeout) {
            Ok((code, lines)) => {
                return classify(url, filename_hint, custom_headers, runtime, timeout, code, lines)
            }
            Err(e) => {
                tracing::debug!(attempt, "probe transport failure for {}: {}", url, e);
                last_err = Some(e);
                if attempt < attempts {
                    std::thread::sleep(PROBE_RETRY_DELAY);
                }
            }
        }
    }
    Err(anyhow::anyhow!(
        "probe of {} failed after {} attempts: {}",
        url,
        attempts,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

fn classify(
    url: &str,
    filename_hint: Option<&str>,
    custom_headers: &HashMap<String, String>,
    runtime: &RuntimeConfig,
    timeout: Duration,
    code: u32,
    lines: Vec<String>,
) -> Result<ProbeResult> {
    match code {
        206 => Ok(build_result(url, filename_hint, true, &lines)),
        200 => Ok(build_result(url, filename_hint, false, &lines)),
        // Some servers reject ranged requests outright; try once plain.
        403 | 405 => {
            let (code, lines) = issue(url, custom_headers, runtime, false, timeout)
                .context("retry without Range failed")?;
            match code {
                206 => Ok(build_result(url, filename_hint, true, &lines)),
                200 => Ok(build_result(url, filename_hint, false, &lines)),
                other => Err(ProbeError::UnexpectedStatus(other).into()),
            }
        }
        other => Err(ProbeError::UnexpectedStatus(other).into()),
    }
}

fn build_result(
    url: &str,
    filename_hint: Option<&str>,
    supports_range: bool,
    lines: &[String],
) -> ProbeResult {
    let headers = parse::parse_headers(lines);
    let file_size = if supports_range {
        headers.content_range_total
    } else {
        headers.content_length
    }
    // A zero advertised size means the origin doesn't actually know it.
    .filter(|n| *n > 0);

    ProbeResult {
        file_size,
        supports_range,
        filename: url_model::derive_filename(
            filename_hint,
            url,
            headers.content_disposition.as_deref(),
        ),
        content_type: headers.content_type,
    }
}

/// One HTTP request; returns the final status code and final-hop headers.
/// The body is aborted after the first write so a `200` from a large file
/// costs one buffer, not the transfer.
fn issue(
    url: &str,
    custom_headers: &HashMap<String, String>,
    runtime: &RuntimeConfig,
    with_range: bool,
    timeout: Duration,
) -> std::result::Result<(u32, Vec<String>), curl::Error> {
    let mut headers: Vec<String> = Vec::new();
    let mut body_aborted = false;

    let mut easy = curl::easy::Easy::new();
    easy.url(url)?;
    easy.get(true)?;
    easy.follow_location(true)?;
    easy.max_redirections(MAX_REDIRECTS)?;
    easy.connect_timeout(Duration::from_secs(10))?;
    easy.timeout(timeout)?;
    easy.useragent(runtime.user_agent())?;
    if let Some(proxy) = runtime.proxy_url() {
        easy.proxy(proxy)?;
    }
    if runtime.skip_tls_verification {
        easy.ssl_verify_peer(false)?;
        easy.ssl_verify_host(false)?;
    }
    if with_range {
        easy.range("0-0")?;
    }

    // Forwarded headers minus Range: the probe's own Range always wins.
    let mut list = curl::easy::List::new();
    let mut have_custom = false;
    for (k, v) in custom_headers {
        if k.trim().eq_ignore_ascii_case("range") {
            continue;
        }
        list.append(&format!("{}: {}", k.trim(), v.trim()))?;
        have_custom = true;
    }
    if have_custom {
        easy.http_headers(list)?;
    }

    let performed = {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                let line = s.trim_end();
                // A new status line means a redirect hop; keep the last hop only.
                if line.starts_with("HTTP/") {
                    headers.clear();
                }
                if !line.is_empty() {
                    headers.push(line.to_string());
                }
            }
            true
        })?;
        transfer.write_function(|data| {
            body_aborted = true;
            let _ = data;
            Ok(0)
        })?;
        transfer.perform()
    };
    match performed {
        Ok(()) => {}
        // The write callback aborts on purpose once headers are in.
        Err(ref e) if e.is_write_error() && body_aborted => {}
        Err(e) => return Err(e),
    }

    let code = easy.response_code()?;
    Ok((code, headers))
}

/// Probe a mirror list concurrently. Inputs are deduplicated; each mirror
/// gets a single attempt with a 5 s timeout. Returns the range-capable
/// survivors (original order) and a failure map for the rest.
pub fn probe_mirrors(
    urls: &[String],
    runtime: &RuntimeConfig,
) -> (Vec<String>, HashMap<String, String>) {
    let mut unique: Vec<String> = Vec::new();
    for u in urls {
        if !unique.contains(u) {
            unique.push(u.clone());
        }
    }

    let handles: Vec<_> = unique
        .iter()
        .map(|u| {
            let url = u.clone();
            let rt = runtime.clone();
            std::thread::spawn(move || {
                let res = probe_with(&url, None, &HashMap::new(), &rt, 1, MIRROR_PROBE_TIMEOUT);
                (url, res)
            })
        })
        .collect();

    let mut valid = Vec::new();
    let mut failures = HashMap::new();
    for h in handles {
        let Ok((url, res)) = h.join() else { continue };
        match res {
            Ok(r) if r.supports_range => valid.push(url),
            Ok(_) => {
                failures.insert(url, "mirror does not support range requests".to_string());
            }
            Err(e) => {
                failures.insert(url, e.to_string());
            }
        }
    }
    (valid, failures)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_result_ranged_with_size() {
        let lines = vec![
            "HTTP/1.1 206 Partial Content".to_string(),
            "Content-Range: bytes 0-0/4096".to_string(),
            "Content-Type: text/plain".to_string(),
        ];
        let r = build_result("https://example.com/f.txt", None, true, &lines);
        assert!(r.supports_range);
        assert_eq!(r.file_size, Some(4096));
        assert_eq!(r.filename, "f.txt");
        assert_eq!(r.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn build_result_unknown_size_star() {
        let lines = vec![
            "HTTP/1.1 206 Partial Content".to_string(),
            "Content-Range: bytes 0-0/*".to_string(),
        ];
        let r = build_result("https://example.com/f", None, true, &lines);
        assert!(r.supports_range);
        assert_eq!(r.file_size, None);
    }

    #[test]
    fn build_result_zero_size_is_unknown() {
        let lines = vec![
            "HTTP/1.1 200 OK".to_string(),
            "Content-Length: 0".to_string(),
        ];
        let r = build_result("https://example.com/f", None, false, &lines);
        assert_eq!(r.file_size, None);
    }

    #[test]
    fn build_result_filename_from_disposition() {
        let lines = vec![
            "HTTP/1.1 200 OK".to_string(),
            "Content-Disposition: attachment; filename=\"report.pdf\"".to_string(),
        ];
        let r = build_result("https://example.com/x", None, false, &lines);
        assert_eq!(r.filename, "report.pdf");
    }

    #[test]
    fn build_result_hint_beats_everything() {
        let lines = vec![
            "HTTP/1.1 200 OK".to_string(),
            "Content-Disposition: attachment; filename=\"other.bin\"".to_string(),
        ];
        let r = build_result("https://example.com/x.zip", Some("mine.iso"), false, &lines);
        assert_eq!(r.filename, "mine.iso");
    }
}
