//! Minimal HTTP/1.1 server with Range support for integration tests.
//!
//! Serves one static body. Understands `Range: bytes=X-Y` with `206` +
//! `Content-Range`; can be told to ignore ranges (plain `200`), answer
//! every request with a fixed status, fail the first N data requests, or
//! throttle body writes so tests can pause mid-transfer. Counts requests
//! and records data-request arrival times for backoff assertions.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Respond to every request with this status and an empty body.
    pub status_override: Option<u32>,
    /// Fail the first N data requests (ranged GETs other than the probe's
    /// `bytes=0-0`) with `fail_status`.
    pub fail_first_data: usize,
    pub fail_status: u32,
    /// Sleep this long between 4 KiB body writes (slows transfers down so
    /// pause can land mid-flight).
    pub throttle: Option<Duration>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            status_override: None,
            fail_first_data: 0,
            fail_status: 429,
            throttle: None,
        }
    }
}

/// Handle to a running test server.
pub struct ServerHandle {
    pub url: String,
    /// Total GET requests served (probes included).
    pub hits: Arc<AtomicUsize>,
    /// Arrival times of data requests, for spacing assertions.
    pub data_times: Arc<Mutex<Vec<Instant>>>,
}

pub fn start(body: Vec<u8>) -> ServerHandle {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> ServerHandle {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let hits = Arc::new(AtomicUsize::new(0));
    let data_times = Arc::new(Mutex::new(Vec::new()));
    let data_fails = Arc::new(AtomicUsize::new(0));

    let handle = ServerHandle {
        url: format!("http://127.0.0.1:{}/file.bin", port),
        hits: Arc::clone(&hits),
        data_times: Arc::clone(&data_times),
    };

    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let hits = Arc::clone(&hits);
            let data_times = Arc::clone(&data_times);
            let data_fails = Arc::clone(&data_fails);
            thread::spawn(move || handle_conn(stream, &body, opts, &hits, &data_times, &data_fails));
        }
    });

    handle
}

fn handle_conn(
    mut stream: std::net::TcpStream,
    body: &[u8],
    opts: RangeServerOptions,
    hits: &AtomicUsize,
    data_times: &Mutex<Vec<Instant>>,
    data_fails: &AtomicUsize,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) => return,
        Ok(n) => n,
        Err(_) => return,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, range) = parse_request(request);
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }
    hits.fetch_add(1, Ordering::SeqCst);

    if let Some(code) = opts.status_override {
        let _ = write_status(&mut stream, code);
        return;
    }

    let total = body.len() as u64;
    let is_probe = range == Some((0, 0)) && total > 1;
    if !is_probe && range.is_some() {
        data_times.lock().unwrap().push(Instant::now());
        if data_fails.fetch_add(1, Ordering::SeqCst) < opts.fail_first_data {
            let _ = write_status(&mut stream, opts.fail_status);
            return;
        }
    }

    let (status, content_range, slice) = if opts.support_ranges && total > 0 {
        match range {
            Some((start, end_incl)) => {
                let start = start.min(total);
                let end_incl = end_incl.min(total.saturating_sub(1));
                if start > end_incl {
                    let _ = write_status(&mut stream, 416);
                    return;
                }
                let start_us = start as usize;
                let end_excl = (end_incl + 1) as usize;
                (
                    "206 Partial Content",
                    Some(format!("bytes {}-{}/{}", start, end_incl, total)),
                    &body[start_us..end_excl],
                )
            }
            None => ("200 OK", None, body),
        }
    } else {
        ("200 OK", None, body)
    };

    let mut response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        slice.len()
    );
    if let Some(cr) = content_range {
        response.push_str(&format!("Content-Range: {}\r\n", cr));
    }
    if opts.support_ranges {
        response.push_str("Accept-Ranges: bytes\r\n");
    }
    response.push_str("\r\n");
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }

    match opts.throttle {
        Some(delay) => {
            for chunk in slice.chunks(4096) {
                if stream.write_all(chunk).is_err() {
                    return;
                }
                thread::sleep(delay);
            }
        }
        None => {
            let _ = stream.write_all(slice);
        }
    }
}

fn write_status(stream: &mut std::net::TcpStream, code: u32) -> std::io::Result<()> {
    stream.write_all(
        format!(
            "HTTP/1.1 {} Test Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            code
        )
        .as_bytes(),
    )
}

/// Returns (method, optional (start, end_inclusive) from `Range: bytes=X-Y`).
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(bounds) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = bounds.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, range)
}
