//! Download engines: range-parallel and single-stream.
//!
//! The engine choice is a capability test on the probe: servers that honour
//! byte ranges (and report a size) get the concurrent engine; everything
//! else streams through the single downloader. Both run as blocking code
//! under `spawn_blocking`, driven by a pool driver that owns store I/O and
//! event emission around them.

pub(crate) mod client;
mod concurrent;
mod single;

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use crate::config::RuntimeConfig;
use crate::events::EventSender;
use crate::probe::{self, ProbeResult};
use crate::progress::ProgressState;
use crate::store::{DownloadId, PersistedDownloadState};
use crate::url_model;

/// Destination paths claimed by in-flight downloads, so two concurrent
/// downloads of `file.txt` never collide before either touches the disk.
pub type ClaimedPaths = Arc<Mutex<HashSet<PathBuf>>>;

/// Immutable request descriptor for one download. Built by the pool at
/// admission and handed to the engine unchanged.
#[derive(Clone)]
pub struct DownloadConfig {
    pub id: DownloadId,
    pub url: String,
    pub mirrors: Vec<String>,
    pub output_dir: PathBuf,
    /// Explicit destination; set when resuming so the file stays put.
    pub dest_path: Option<PathBuf>,
    pub filename_hint: Option<String>,
    /// Forwarded request headers (e.g. cookies from a browser handoff).
    pub headers: HashMap<String, String>,
    pub is_resume: bool,
    pub progress: Arc<ProgressState>,
    pub runtime: Arc<RuntimeConfig>,
    pub events: EventSender,
}

/// Which engine serves a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Concurrent,
    Single,
}

/// Capability test: ranges plus a known size buy the concurrent engine.
pub fn select_engine(probed: &ProbeResult, runtime: &RuntimeConfig) -> Engine {
    if runtime.sequential_download || !probed.supports_range || probed.file_size.is_none() {
        Engine::Single
    } else {
        Engine::Concurrent
    }
}

/// Terminal result of one engine run. Setup failures (probe, filesystem)
/// surface as `Err` from [`run_download`] instead.
#[derive(Debug)]
pub enum EngineOutcome {
    Complete {
        filename: String,
        dest_path: PathBuf,
        total_size: u64,
        elapsed_ms: u64,
    },
    Paused {
        dest_path: Option<PathBuf>,
        /// Resume snapshot; `None` for single-stream downloads, which
        /// restart from scratch.
        state: Option<PersistedDownloadState>,
    },
    Cancelled {
        dest_path: Option<PathBuf>,
    },
    Failed {
        error: String,
        dest_path: Option<PathBuf>,
        state: Option<PersistedDownloadState>,
    },
}

/// Run one download to a terminal outcome. Blocking; the caller supplies a
/// resume snapshot when it has one, the per-download cancel flag, and the
/// pool-wide claim set.
pub fn run_download(
    cfg: &DownloadConfig,
    resume: Option<PersistedDownloadState>,
    cancel: &Arc<AtomicBool>,
    claimed: &ClaimedPaths,
) -> Result<EngineOutcome> {
    if let Some(state) = resume {
        return concurrent::run_resumed(cfg, state, cancel);
    }

    // Mirror probing overlaps the primary probe; failures shrink the
    // rotation before any worker picks a mirror.
    let mirror_handle = (!cfg.mirrors.is_empty()).then(|| {
        let urls = cfg.mirrors.clone();
        let rt = (*cfg.runtime).clone();
        std::thread::spawn(move || probe::probe_mirrors(&urls, &rt))
    });

    let primary = probe::probe(
        &cfg.url,
        cfg.filename_hint.as_deref(),
        &cfg.headers,
        &cfg.runtime,
    );

    let mut valid_mirrors: Vec<String> = Vec::new();
    if let Some(handle) = mirror_handle {
        if let Ok((valid, failures)) = handle.join() {
            for (url, err) in &failures {
                tracing::warn!("disabling mirror {}: {}", url, err);
                cfg.progress.mirrors().disable(url);
            }
            valid_mirrors = valid;
        }
    }

    // A dead primary doesn't kill the download while a range-capable mirror
    // can answer for it; the rotation benches the primary soon enough.
    let probed = match primary {
        Ok(p) => p,
        Err(primary_err) => {
            let mut salvaged = None;
            for url in &valid_mirrors {
                match probe::probe(url, cfg.filename_hint.as_deref(), &cfg.headers, &cfg.runtime) {
                    Ok(p) => {
                        tracing::info!(
                            "primary probe failed ({:#}); continuing via mirror {}",
                            primary_err,
                            url
                        );
                        salvaged = Some(p);
                        break;
                    }
                    Err(e) => tracing::debug!("mirror {} probe failed: {}", url, e),
                }
            }
            match salvaged {
                Some(p) => p,
                None => return Err(primary_err),
            }
        }
    };

    match select_engine(&probed, &cfg.runtime) {
        Engine::Concurrent => concurrent::run_fresh(cfg, &probed, cancel, claimed),
        Engine::Single => single::run(cfg, &probed, cancel, claimed),
    }
}

/// Resolve (and claim) the destination path for a fresh download.
pub(crate) fn resolve_destination(
    cfg: &DownloadConfig,
    filename: &str,
    claimed: &ClaimedPaths,
) -> Result<(PathBuf, String)> {
    if let Some(dest) = &cfg.dest_path {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let name = dest
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());
        claimed.lock().unwrap().insert(dest.clone());
        return Ok((dest.clone(), name));
    }

    let mut dir = cfg.output_dir.clone();
    if cfg.runtime.preserve_url_path {
        for seg in url_model::dir_segments_from_url(&cfg.url) {
            dir.push(seg);
        }
    }
    std::fs::create_dir_all(&dir)?;

    let mut guard = claimed.lock().unwrap();
    let (dest, name) = url_model::unique_destination(&dir, filename, &guard)?;
    guard.insert(dest.clone());
    Ok((dest, name))
}

/// Drop a claim taken by [`resolve_destination`] (error paths inside the
/// engine; the driver releases claims for normal outcomes).
pub(crate) fn release_claim(claimed: &ClaimedPaths, dest: &PathBuf) {
    claimed.lock().unwrap().remove(dest);
}
