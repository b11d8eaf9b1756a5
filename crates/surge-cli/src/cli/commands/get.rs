//! Foreground download command.

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use surge_core::config::RuntimeConfig;
use surge_core::events::{self, DownloadEvent};
use surge_core::pool::{DownloadPool, DownloadRequest};
use surge_core::store::StateStore;
use surge_core::url_model;

/// Add every URL to a fresh pool and stream events until all downloads
/// reach a terminal state. Returns an error if any of them failed.
pub async fn run_get(
    store: StateStore,
    runtime: RuntimeConfig,
    urls: &[String],
    dir: PathBuf,
    filename: Option<String>,
) -> Result<()> {
    if filename.is_some() && urls.len() > 1 {
        bail!("--filename only makes sense with a single URL");
    }

    let (events, mut rx) = events::channel(events::DEFAULT_EVENT_BUFFER);
    let pool = DownloadPool::new(store, Arc::new(runtime), events);

    let mut pending: HashSet<String> = HashSet::new();
    for arg in urls {
        let Some((url, mirrors)) = url_model::parse_url_list(arg) else {
            bail!("no usable URL in {:?}", arg);
        };
        let id = pool
            .add(DownloadRequest {
                url,
                mirrors,
                output_dir: dir.clone(),
                filename: filename.clone(),
                headers: Default::default(),
            })
            .await?;
        pending.insert(id);
    }

    let mut failures = 0usize;
    while !pending.is_empty() {
        let Some(event) = rx.recv().await else { break };
        match event {
            DownloadEvent::Started { id, filename, total_size, .. } => {
                println!("[{}] {} ({} bytes)", &id, filename, total_size);
            }
            DownloadEvent::Progress {
                id,
                downloaded,
                total_size,
                speed,
                connections,
                ..
            } => {
                if total_size > 0 {
                    println!(
                        "[{}] {:5.1}%  {:8.2} MB/s  {} conn",
                        &id,
                        downloaded as f64 / total_size as f64 * 100.0,
                        speed / (1024.0 * 1024.0),
                        connections
                    );
                }
            }
            DownloadEvent::Queued { id, filename } => {
                println!("[{}] queued {}", &id, filename);
            }
            DownloadEvent::Complete { id, filename, elapsed_ms, total_size } => {
                println!(
                    "[{}] done: {} ({} bytes in {:.1}s)",
                    &id,
                    filename,
                    total_size,
                    elapsed_ms as f64 / 1000.0
                );
                pending.remove(&id);
            }
            DownloadEvent::Error { id, filename, err } => {
                eprintln!("[{}] failed: {}: {}", &id, filename, err);
                failures += 1;
                pending.remove(&id);
            }
            DownloadEvent::Paused { id, .. } | DownloadEvent::Removed { id, .. } => {
                // Not reachable from this command, but a shared bus could
                // carry them; stop waiting for that id either way.
                pending.remove(&id);
            }
            DownloadEvent::Resumed { .. } | DownloadEvent::Request { .. } => {}
        }
    }

    if failures > 0 {
        bail!("{} download(s) failed", failures);
    }
    Ok(())
}
