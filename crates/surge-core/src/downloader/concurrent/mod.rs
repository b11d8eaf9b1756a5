//! Range-parallel download engine.
//!
//! Setup seeds the task queue with one task per incomplete chunk, then W
//! worker threads race the queue while a balancer splits the largest task
//! for idle workers and a health monitor restarts slow or stalled workers.
//! Pause, cancel, and fatal errors all converge on the same unwind: workers
//! re-enqueue their unfinished ranges, the queue closes, and the driver gets
//! a terminal [`EngineOutcome`].

mod balancer;
mod monitor;
mod worker;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::events::DownloadEvent;
use crate::probe::ProbeResult;
use crate::progress::ChunkBitmap;
use crate::storage::WorkingFile;
use crate::store::{self, PersistedDownloadState};
use crate::task::{self, Task, TaskQueue};

use super::{release_claim, resolve_destination, ClaimedPaths, DownloadConfig, EngineOutcome};

/// Per-worker health ledger, written by the worker and read by the monitor.
pub(crate) struct WorkerSlot {
    /// Cumulative bytes this worker has written.
    pub bytes: AtomicU64,
    pub busy: AtomicBool,
    /// Set by the monitor; the worker aborts its transfer and re-enqueues.
    pub restart: AtomicBool,
    /// Milliseconds since engine start of the last byte written.
    pub last_progress_ms: AtomicU64,
}

impl WorkerSlot {
    fn new() -> Self {
        WorkerSlot {
            bytes: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            last_progress_ms: AtomicU64::new(0),
        }
    }
}

/// State shared by the workers, balancer, monitor, and driver thread.
pub(crate) struct EngineShared {
    pub cfg: DownloadConfig,
    pub queue: TaskQueue,
    pub file: WorkingFile,
    pub cancel: Arc<AtomicBool>,
    /// First fatal error wins; everything after is a casualty of the unwind.
    pub fatal: Mutex<Option<String>>,
    pub started: Instant,
    pub slots: Vec<WorkerSlot>,
}

impl EngineShared {
    pub(crate) fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Record the first fatal error and begin the engine-wide unwind.
    pub(crate) fn raise_fatal(&self, message: String) {
        let mut fatal = self.fatal.lock().unwrap();
        if fatal.is_none() {
            tracing::warn!("download {} fatal: {}", self.cfg.id, message);
            *fatal = Some(message);
        }
        drop(fatal);
        self.cancel.store(true, Ordering::SeqCst);
        self.queue.close();
    }
}

/// Fresh concurrent download: probe already done, ranges confirmed.
pub(crate) fn run_fresh(
    cfg: &DownloadConfig,
    probed: &ProbeResult,
    cancel: &Arc<AtomicBool>,
    claimed: &ClaimedPaths,
) -> Result<EngineOutcome> {
    let total = probed
        .file_size
        .context("concurrent engine needs a known size")?;
    let (dest, filename) = resolve_destination(cfg, &probed.filename, claimed)?;

    let file = match WorkingFile::create(&dest, total) {
        Ok(f) => f,
        Err(e) => {
            release_claim(claimed, &dest);
            return Err(e);
        }
    };

    let runtime = &cfg.runtime;
    let chunk_size = task::initial_chunk_size(total, runtime.connections(), runtime.min_chunk_size());
    let chunks = task::chunk_count(total, chunk_size);

    let progress = &cfg.progress;
    progress.set_total_size(total);
    progress.set_chunk_size(chunk_size);
    progress.set_bitmap(ChunkBitmap::new(chunks));
    progress.start_session();

    let tasks = task::seed_tasks(total, chunk_size, |_| false);

    cfg.events.emit(DownloadEvent::Started {
        id: cfg.id.clone(),
        url: cfg.url.clone(),
        filename: filename.clone(),
        total_size: total,
        dest_path: dest.clone(),
        state: Some("new".to_string()),
    });
    progress.mark_started();

    drive(cfg, file, dest, filename, total, tasks, cancel)
}

/// Resume from a persisted snapshot: restore counters, bitmap, and the
/// remaining task list, then drive as usual.
pub(crate) fn run_resumed(
    cfg: &DownloadConfig,
    state: PersistedDownloadState,
    cancel: &Arc<AtomicBool>,
) -> Result<EngineOutcome> {
    let dest = PathBuf::from(&state.dest_path);
    let file = WorkingFile::open_existing(&dest)
        .with_context(|| format!("resume of {} lost its working file", cfg.id))?;

    let total = state.total_size;
    let chunks = task::chunk_count(total, state.chunk_size);

    let progress = &cfg.progress;
    progress.clear_pause();
    progress.set_total_size(total);
    progress.set_chunk_size(state.chunk_size);
    progress.set_bitmap(ChunkBitmap::from_bytes(&state.bitmap, chunks));
    progress.set_downloaded(state.downloaded);
    progress.set_elapsed_before_ms(state.elapsed_ms);
    progress.start_session();

    // Attempt counters don't survive a pause; a resumed task starts clean.
    let tasks: Vec<Task> = state
        .tasks
        .iter()
        .map(|t| Task::new(t.offset, t.length))
        .collect();
    progress.prime_resume_accounting(&tasks);

    cfg.events.emit(DownloadEvent::Started {
        id: cfg.id.clone(),
        url: cfg.url.clone(),
        filename: state.filename.clone(),
        total_size: total,
        dest_path: dest.clone(),
        state: Some("resumed".to_string()),
    });
    progress.mark_started();

    drive(cfg, file, dest, state.filename, total, tasks, cancel)
}

fn drive(
    cfg: &DownloadConfig,
    file: WorkingFile,
    dest: PathBuf,
    filename: String,
    total: u64,
    tasks: Vec<Task>,
    cancel: &Arc<AtomicBool>,
) -> Result<EngineOutcome> {
    let progress = &cfg.progress;

    // Nothing left to fetch (resume of a fully-written file): finalize now.
    if tasks.is_empty() {
        file.sync()?;
        progress.mark_bitmap_verified();
        file.finalize(&dest)?;
        progress.set_done();
        return Ok(EngineOutcome::Complete {
            filename,
            dest_path: dest,
            total_size: total,
            elapsed_ms: progress.elapsed_ms(),
        });
    }

    let connections = cfg.runtime.connections();
    let shared = Arc::new(EngineShared {
        cfg: cfg.clone(),
        queue: TaskQueue::new(cfg.runtime.min_chunk_size()),
        file: file.clone(),
        cancel: Arc::clone(cancel),
        fatal: Mutex::new(None),
        started: Instant::now(),
        slots: (0..connections).map(|_| WorkerSlot::new()).collect(),
    });
    shared.queue.push_many(tasks);

    let mut workers = Vec::with_capacity(connections);
    for slot_idx in 0..connections {
        let s = Arc::clone(&shared);
        workers.push(std::thread::spawn(move || worker::worker_loop(s, slot_idx)));
    }
    let balancer = {
        let s = Arc::clone(&shared);
        std::thread::spawn(move || balancer::run(&s))
    };
    let health = {
        let s = Arc::clone(&shared);
        std::thread::spawn(move || monitor::run(&s))
    };

    for h in workers {
        if h.join().is_err() {
            shared.raise_fatal("worker thread panicked".to_string());
        }
    }
    // Workers are gone; make sure the helpers see a closed queue and leave.
    shared.queue.close();
    let _ = balancer.join();
    let _ = health.join();

    let paused = progress.is_paused();
    let fatal = shared.fatal.lock().unwrap().take();

    if let Some(error) = fatal {
        let _ = file.sync();
        let state = build_state(cfg, &dest, &filename, total, &shared.queue);
        return Ok(EngineOutcome::Failed {
            error,
            dest_path: Some(dest),
            state: Some(state),
        });
    }

    if cancel.load(Ordering::SeqCst) && !paused {
        let _ = file.discard();
        return Ok(EngineOutcome::Cancelled {
            dest_path: Some(dest),
        });
    }

    if paused {
        file.sync()?;
        progress.mark_bitmap_verified();
        let state = build_state(cfg, &dest, &filename, total, &shared.queue);
        return Ok(EngineOutcome::Paused {
            dest_path: Some(dest),
            state: Some(state),
        });
    }

    if !progress.all_chunks_completed() {
        // Queue drained without covering the file: a task was lost, which is
        // an engine bug, not a network condition. Keep the state around.
        let _ = file.sync();
        let state = build_state(cfg, &dest, &filename, total, &shared.queue);
        return Ok(EngineOutcome::Failed {
            error: "download ended with incomplete chunks".to_string(),
            dest_path: Some(dest),
            state: Some(state),
        });
    }

    file.sync()?;
    progress.mark_bitmap_verified();
    file.finalize(&dest)?;
    progress.set_done();
    Ok(EngineOutcome::Complete {
        filename,
        dest_path: dest,
        total_size: total,
        elapsed_ms: progress.elapsed_ms(),
    })
}

/// Snapshot everything a future resume needs.
fn build_state(
    cfg: &DownloadConfig,
    dest: &Path,
    filename: &str,
    total: u64,
    queue: &TaskQueue,
) -> PersistedDownloadState {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let progress = &cfg.progress;
    PersistedDownloadState {
        id: cfg.id.clone(),
        url: cfg.url.clone(),
        url_hash: store::url_hash(&cfg.url),
        dest_path: dest.to_string_lossy().into_owned(),
        filename: filename.to_string(),
        total_size: total,
        downloaded: progress.downloaded(),
        tasks: queue.snapshot(),
        bitmap: progress.bitmap_bytes(),
        chunk_size: progress.chunk_size(),
        mirrors: progress.mirrors().urls(),
        created_at: now,
        paused_at: Some(now),
        elapsed_ms: progress.elapsed_ms(),
    }
}
