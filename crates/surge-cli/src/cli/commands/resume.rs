//! Resume a paused download in the foreground.

use anyhow::Result;
use std::sync::Arc;

use surge_core::config::RuntimeConfig;
use surge_core::events::{self, DownloadEvent};
use surge_core::pool::DownloadPool;
use surge_core::store::StateStore;

pub async fn run_resume(store: StateStore, runtime: RuntimeConfig, id_prefix: &str) -> Result<()> {
    let id = store.resolve_by_prefix(id_prefix).await?;
    let (events, mut rx) = events::channel(events::DEFAULT_EVENT_BUFFER);
    let pool = DownloadPool::new(store, Arc::new(runtime), events);

    pool.resume(&id).await?;
    println!("resuming {}", id);

    while let Some(event) = rx.recv().await {
        match event {
            DownloadEvent::Progress {
                downloaded,
                total_size,
                speed,
                ..
            } if total_size > 0 => {
                println!(
                    "{:5.1}%  {:8.2} MB/s",
                    downloaded as f64 / total_size as f64 * 100.0,
                    speed / (1024.0 * 1024.0)
                );
            }
            DownloadEvent::Complete {
                filename,
                total_size,
                elapsed_ms,
                ..
            } => {
                println!(
                    "done: {} ({} bytes in {:.1}s)",
                    filename,
                    total_size,
                    elapsed_ms as f64 / 1000.0
                );
                return Ok(());
            }
            DownloadEvent::Error { filename, err, .. } => {
                anyhow::bail!("{} failed: {}", filename, err);
            }
            _ => {}
        }
    }
    Ok(())
}
