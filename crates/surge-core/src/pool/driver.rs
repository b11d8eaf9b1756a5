//! Per-download driver: runs the blocking engine, keeps the store and the
//! event bus in step, and retires the download from the pool afterwards.
//!
//! Event contract: `Started` precedes the first `Progress`; exactly one of
//! `Complete`/`Error` ends the stream; `Paused`/`Resumed` may appear any
//! number of times in between. The driver owns everything terminal; the
//! engine emits only `Started`. Store mutations land before the matching
//! event is published and before the download leaves the active set, so a
//! caller reacting to `Paused` already sees consistent persisted state.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::downloader::{self, DownloadConfig, EngineOutcome};
use crate::events::{DownloadEvent, ErrorValue, EventSender};
use crate::progress::ProgressState;
use crate::store::{self, DownloadStatusKind, PersistedDownloadState, StoreError};

use super::PoolInner;

/// Progress emission period.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

pub(super) async fn run(inner: Arc<PoolInner>, config: DownloadConfig, cancel: Arc<AtomicBool>) {
    let id = config.id.clone();
    let _ = inner
        .store
        .update_status(&id, DownloadStatusKind::Downloading, None)
        .await;

    // Resolve the resume snapshot, if any. A missing snapshot (e.g. a
    // paused single-stream download) restarts from scratch.
    let mut resume: Option<PersistedDownloadState> = None;
    let mut resume_failure: Option<String> = None;
    if config.is_resume {
        if let Some(dest) = &config.dest_path {
            let url_hash = store::url_hash(&config.url);
            match inner
                .store
                .load_state(&url_hash, &dest.to_string_lossy())
                .await
            {
                Ok(state) => resume = Some(state),
                Err(e) if matches!(e.downcast_ref::<StoreError>(), Some(StoreError::NotFound)) => {}
                Err(e) => resume_failure = Some(format!("resume state unreadable: {e:#}")),
            }
        }
        if resume_failure.is_none() {
            inner
                .events
                .emit_async(DownloadEvent::Resumed {
                    id: id.clone(),
                    filename: fallback_filename(&config),
                })
                .await;
        }
    }

    let events_out = if let Some(message) = resume_failure {
        error_events(&inner, &config, message).await
    } else {
        let ticker = tokio::spawn(progress_loop(
            inner.events.clone(),
            Arc::clone(&config.progress),
            id.clone(),
        ));

        let engine_result = tokio::task::spawn_blocking({
            let cfg = config.clone();
            let cancel = Arc::clone(&cancel);
            let claimed = Arc::clone(&inner.claimed);
            move || downloader::run_download(&cfg, resume, &cancel, &claimed)
        })
        .await;

        ticker.abort();

        match engine_result {
            Err(join_err) => {
                error_events(&inner, &config, format!("engine task failed: {join_err}")).await
            }
            Ok(Err(setup_err)) => error_events(&inner, &config, format!("{setup_err:#}")).await,
            Ok(Ok(outcome)) => outcome_events(&inner, &config, outcome).await,
        }
    };

    // Leave the active set before announcing: a caller reacting to Paused
    // or Complete must find the pool and store already settled.
    inner.retire(&id);
    for event in events_out {
        inner.events.emit_async(event).await;
    }
}

/// Apply an outcome to the store and build the events to publish.
async fn outcome_events(
    inner: &Arc<PoolInner>,
    config: &DownloadConfig,
    outcome: EngineOutcome,
) -> Vec<DownloadEvent> {
    let id = &config.id;
    match outcome {
        EngineOutcome::Complete {
            filename,
            dest_path,
            total_size,
            elapsed_ms,
        } => {
            let url_hash = store::url_hash(&config.url);
            let dest_str = dest_path.to_string_lossy().into_owned();
            let _ = inner.store.delete_state(&url_hash, &dest_str).await;
            let _ = inner.store.update_location(id, &filename, &dest_str).await;
            let _ = inner.store.mark_completed(id, total_size, elapsed_ms).await;
            release(inner, Some(&dest_path));
            vec![
                // Final sample so even a blink-fast download shows one.
                DownloadEvent::Progress {
                    id: id.clone(),
                    downloaded: total_size,
                    total_size,
                    speed: config.progress.speed() as f64,
                    elapsed_ms,
                    connections: 0,
                    bitmap: config.progress.bitmap_bytes(),
                    chunk_size: config.progress.chunk_size(),
                    chunk_progress: config.progress.chunk_progress_snapshot(),
                },
                DownloadEvent::Complete {
                    id: id.clone(),
                    filename,
                    elapsed_ms,
                    total_size,
                },
            ]
        }
        EngineOutcome::Paused { dest_path, state } => {
            let downloaded = config.progress.downloaded();
            let filename = match &state {
                Some(state) => state.filename.clone(),
                None => fallback_filename(config),
            };
            if let Some(state) = state {
                if let Err(e) = inner.store.save_state(&state).await {
                    return error_events(
                        inner,
                        config,
                        format!("failed to persist pause state: {e:#}"),
                    )
                    .await;
                }
                let _ = inner
                    .store
                    .update_location(id, &state.filename, &state.dest_path)
                    .await;
                let _ = inner
                    .store
                    .update_progress(id, state.downloaded, Some(state.total_size))
                    .await;
            }
            let _ = inner
                .store
                .update_status(id, DownloadStatusKind::Paused, None)
                .await;
            release(inner, dest_path.as_ref());
            vec![DownloadEvent::Paused {
                id: id.clone(),
                filename,
                downloaded,
            }]
        }
        EngineOutcome::Cancelled { dest_path } => {
            let url_hash = store::url_hash(&config.url);
            if let Some(dest) = &dest_path {
                let _ = inner
                    .store
                    .delete_state(&url_hash, &dest.to_string_lossy())
                    .await;
            }
            let filename = inner
                .store
                .get_entry(id)
                .await
                .ok()
                .flatten()
                .map(|e| e.filename)
                .unwrap_or_else(|| fallback_filename(config));
            let _ = inner.store.remove_entry(id).await;
            release(inner, dest_path.as_ref());
            vec![DownloadEvent::Removed {
                id: id.clone(),
                filename,
            }]
        }
        EngineOutcome::Failed {
            error,
            dest_path,
            state,
        } => {
            if let Some(state) = &state {
                let _ = inner.store.save_state(state).await;
                let _ = inner
                    .store
                    .update_progress(id, state.downloaded, Some(state.total_size))
                    .await;
            }
            release(inner, dest_path.as_ref());
            error_events(inner, config, error).await
        }
    }
}

/// Exactly-once `Error` path: store status plus the terminal event.
async fn error_events(
    inner: &Arc<PoolInner>,
    config: &DownloadConfig,
    message: String,
) -> Vec<DownloadEvent> {
    tracing::warn!("download {} failed: {}", config.id, message);
    let _ = inner
        .store
        .update_status(&config.id, DownloadStatusKind::Error, Some(&message))
        .await;
    vec![DownloadEvent::Error {
        id: config.id.clone(),
        filename: fallback_filename(config),
        err: ErrorValue::new(message),
    }]
}

fn fallback_filename(config: &DownloadConfig) -> String {
    config
        .filename_hint
        .clone()
        .unwrap_or_else(|| crate::url_model::derive_filename(None, &config.url, None))
}

fn release(inner: &Arc<PoolInner>, dest: Option<&std::path::PathBuf>) {
    if let Some(dest) = dest {
        inner.claimed.lock().unwrap().remove(dest);
    }
}

/// Emit `Progress` on a fixed cadence once the engine has announced itself.
/// Dropped by the driver when the engine returns; also self-terminates on
/// done/pause so a cancelled ticker never outlives its download.
async fn progress_loop(events: EventSender, progress: Arc<ProgressState>, id: String) {
    let mut prev = progress.downloaded();
    loop {
        tokio::time::sleep(PROGRESS_INTERVAL).await;
        if !progress.is_started() {
            continue;
        }
        let downloaded = progress.downloaded();
        let speed = (downloaded.saturating_sub(prev)) as f64 / PROGRESS_INTERVAL.as_secs_f64();
        prev = downloaded;
        progress.set_speed(speed as u64);
        events
            .emit_async(DownloadEvent::Progress {
                id: id.clone(),
                downloaded,
                total_size: progress.total_size(),
                speed,
                elapsed_ms: progress.elapsed_ms(),
                connections: progress.active_workers(),
                bitmap: progress.bitmap_bytes(),
                chunk_size: progress.chunk_size(),
                chunk_progress: progress.chunk_progress_snapshot(),
            })
            .await;
        if progress.is_done() || progress.is_paused() {
            return;
        }
    }
}
