//! Transfer handle construction shared by the engines.
//!
//! Maps the runtime knobs onto libcurl options: dial/TLS limits, keepalive,
//! proxy (`http://`/`https://`/`socks5://` URL schemes are handled natively
//! by libcurl), optional TLS-verification skip, HTTP/2 preference, and the
//! per-worker transfer buffer.

use anyhow::{Context, Result};
use curl::easy::{Easy2, Handler, HttpVersion, List};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::RuntimeConfig;

/// Redirect ceiling for transfer requests (same as the probe's).
const MAX_REDIRECTS: u32 = 10;

/// Apply common options to a transfer handle. `range` is the worker's
/// `Range` value (`"start-end"`); it always wins over a forwarded `Range`
/// header, which is filtered out of `custom_headers`.
pub(crate) fn configure<H: Handler>(
    easy: &mut Easy2<H>,
    url: &str,
    custom_headers: &HashMap<String, String>,
    runtime: &RuntimeConfig,
    range: Option<&str>,
) -> Result<()> {
    easy.url(url).context("invalid URL")?;
    easy.get(true)?;
    easy.follow_location(true)?;
    easy.max_redirections(MAX_REDIRECTS)?;
    easy.connect_timeout(Duration::from_secs(10))?;
    easy.tcp_keepalive(true)?;
    easy.tcp_keepintvl(Duration::from_secs(30))?;
    easy.buffer_size(runtime.worker_buffer_size())?;
    easy.useragent(runtime.user_agent())?;
    // Transport-level stall belt; the health monitor is the real supervisor.
    easy.low_speed_limit(1024)?;
    easy.low_speed_time(Duration::from_secs(60))?;
    // Periodic progress callbacks carry the cooperative abort checks.
    easy.progress(true)?;
    // Prefer HTTP/2 when libcurl has it; not every build does.
    let _ = easy.http_version(HttpVersion::V2TLS);

    if let Some(proxy) = runtime.proxy_url() {
        easy.proxy(proxy).context("invalid proxy URL")?;
    }
    if runtime.skip_tls_verification {
        easy.ssl_verify_peer(false)?;
        easy.ssl_verify_host(false)?;
    }
    if let Some(range) = range {
        easy.range(range)?;
    }

    let mut list = List::new();
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

    Ok(())
}
