//! Worker pool: per-process download scheduler.
//!
//! Admits `DownloadRequest`s up to `max_concurrent_downloads`; the overflow
//! queues FIFO and is promoted as slots free up. Each admitted download gets
//! a driver task that runs the blocking engine, forwards lifecycle events,
//! and keeps the store in step. Control operations (pause/resume/cancel)
//! act on the live state when the download is running and fall back to the
//! store when it is not.

mod driver;
mod status;

pub use status::DownloadStatus;

use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::RuntimeConfig;
use crate::downloader::{ClaimedPaths, DownloadConfig};
use crate::events::{DownloadEvent, EventSender};
use crate::progress::ProgressState;
use crate::store::{
    self, DownloadEntry, DownloadId, DownloadStatusKind, StateStore, StoreError,
};
use crate::url_model;

/// What a caller submits; the pool turns it into a full `DownloadConfig`.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    pub mirrors: Vec<String>,
    pub output_dir: PathBuf,
    pub filename: Option<String>,
    pub headers: HashMap<String, String>,
}

pub(crate) struct ActiveDownload {
    pub config: DownloadConfig,
    pub cancel: Arc<AtomicBool>,
    pub handle: Option<tokio::task::JoinHandle<()>>,
}

pub(crate) struct PoolInner {
    pub store: StateStore,
    pub events: EventSender,
    pub runtime: Arc<RuntimeConfig>,
    pub claimed: ClaimedPaths,
    pub active: Mutex<HashMap<DownloadId, ActiveDownload>>,
    pub queued: Mutex<VecDeque<DownloadConfig>>,
}

/// The download pool. Cheap to clone; all clones share one scheduler.
#[derive(Clone)]
pub struct DownloadPool {
    inner: Arc<PoolInner>,
}

impl DownloadPool {
    pub fn new(store: StateStore, runtime: Arc<RuntimeConfig>, events: EventSender) -> Self {
        DownloadPool {
            inner: Arc::new(PoolInner {
                store,
                events,
                runtime,
                claimed: Arc::new(Mutex::new(HashSet::new())),
                active: Mutex::new(HashMap::new()),
                queued: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Admit a download. Returns its id; the download either starts right
    /// away or queues behind the concurrency cap (emitting `Queued`).
    pub async fn add(&self, request: DownloadRequest) -> Result<DownloadId> {
        if request.url.trim().is_empty() {
            bail!("download URL is required");
        }
        if let Some(name) = &request.filename {
            if name.contains('/') || name.contains('\\') {
                bail!("filename must not contain path separators");
            }
        }

        // Best-effort filename until the probe refines it.
        let filename = request
            .filename
            .clone()
            .unwrap_or_else(|| url_model::derive_filename(None, &request.url, None));
        let dest_guess = request.output_dir.join(&filename);
        let id = store::new_download_id(&request.url, &dest_guess.to_string_lossy());

        let entry = DownloadEntry {
            id: id.clone(),
            url: request.url.clone(),
            url_hash: store::url_hash(&request.url),
            dest_path: dest_guess.to_string_lossy().into_owned(),
            filename: filename.clone(),
            status: DownloadStatusKind::Queued,
            total_size: None,
            downloaded: 0,
            completed_at: None,
            time_taken_ms: None,
            mirrors: request.mirrors.clone(),
            error: None,
        };
        self.inner.store.add_entry(&entry).await.context("admit download")?;

        let config = DownloadConfig {
            id: id.clone(),
            url: request.url.clone(),
            mirrors: request.mirrors.clone(),
            output_dir: request.output_dir,
            dest_path: None,
            filename_hint: request.filename,
            headers: request.headers,
            is_resume: false,
            progress: Arc::new(ProgressState::new(&request.url, &request.mirrors)),
            runtime: Arc::clone(&self.inner.runtime),
            events: self.inner.events.clone(),
        };

        if self.running_count() >= self.inner.runtime.max_concurrent_downloads() {
            self.inner
                .events
                .emit_async(DownloadEvent::Queued {
                    id: id.clone(),
                    filename,
                })
                .await;
            self.inner.queued.lock().unwrap().push_back(config);
        } else {
            self.spawn_driver(config);
        }
        Ok(id)
    }

    /// Pause a download. Returns whether it was live; a queued download is
    /// parked as paused instead. Unknown ids fail with not-found.
    pub async fn pause(&self, id: &str) -> Result<bool> {
        {
            let active = self.inner.active.lock().unwrap();
            if let Some(dl) = active.get(id) {
                dl.config.progress.request_pause();
                return Ok(true);
            }
        }
        if let Some(config) = self.take_queued(id) {
            self.inner
                .store
                .update_status(id, DownloadStatusKind::Paused, None)
                .await?;
            self.inner
                .events
                .emit_async(DownloadEvent::Paused {
                    id: id.to_string(),
                    filename: config
                        .filename_hint
                        .unwrap_or_else(|| url_model::derive_filename(None, &config.url, None)),
                    downloaded: 0,
                })
                .await;
            return Ok(false);
        }
        Err(StoreError::NotFound.into())
    }

    /// Resume a paused download: live-paused or cold from the store, both
    /// paths go through the persisted state. Fails with not-found for an
    /// unknown id and refuses already-complete downloads.
    pub async fn resume(&self, id: &str) -> Result<()> {
        {
            let active = self.inner.active.lock().unwrap();
            if let Some(dl) = active.get(id) {
                if !dl.config.progress.is_paused() {
                    bail!("download {} is already running", id);
                }
                // A live pause is still unwinding; the driver will persist
                // state and retire the entry. The caller retries after that.
                bail!("download {} is still pausing, try again", id);
            }
        }

        let entry = self
            .inner
            .store
            .get_entry(id)
            .await?
            .ok_or(StoreError::NotFound)?;
        if entry.status == DownloadStatusKind::Completed {
            bail!("download {} is already complete", id);
        }

        let mirrors = entry.mirrors.clone();
        let dest = PathBuf::from(&entry.dest_path);
        let config = DownloadConfig {
            id: entry.id.clone(),
            url: entry.url.clone(),
            mirrors: mirrors.clone(),
            output_dir: dest.parent().map(PathBuf::from).unwrap_or_default(),
            dest_path: Some(dest.clone()),
            filename_hint: Some(entry.filename.clone()),
            headers: HashMap::new(),
            is_resume: true,
            progress: Arc::new(ProgressState::new(&entry.url, &mirrors)),
            runtime: Arc::clone(&self.inner.runtime),
            events: self.inner.events.clone(),
        };

        if self.running_count() >= self.inner.runtime.max_concurrent_downloads() {
            self.inner
                .events
                .emit_async(DownloadEvent::Queued {
                    id: entry.id,
                    filename: entry.filename,
                })
                .await;
            self.inner.queued.lock().unwrap().push_back(config);
        } else {
            self.spawn_driver(config);
        }
        Ok(())
    }

    /// Cancel a download wherever it is: live (aborts the engine), queued,
    /// or cold in the store. Silent when the id is unknown.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        {
            let active = self.inner.active.lock().unwrap();
            if let Some(dl) = active.get(id) {
                dl.cancel.store(true, Ordering::SeqCst);
                // The driver finishes the cleanup and emits Removed.
                return Ok(());
            }
        }
        let queued = self.take_queued(id);
        let entry = self.inner.store.get_entry(id).await?;
        if queued.is_none() && entry.is_none() {
            return Ok(());
        }
        if let Some(entry) = &entry {
            self.inner
                .store
                .delete_state(&entry.url_hash, &entry.dest_path)
                .await?;
            let _ = crate::storage::remove_working_file(&PathBuf::from(&entry.dest_path));
        }
        self.inner.store.remove_entry(id).await?;
        let filename = entry
            .map(|e| e.filename)
            .or_else(|| queued.map(|c| url_model::derive_filename(c.filename_hint.as_deref(), &c.url, None)))
            .unwrap_or_default();
        self.inner
            .events
            .emit_async(DownloadEvent::Removed {
                id: id.to_string(),
                filename,
            })
            .await;
        self.promote_queued();
        Ok(())
    }

    /// Read-only status snapshot: live state first, store as fallback.
    pub async fn get_status(&self, id: &str) -> Result<Option<DownloadStatus>> {
        {
            let active = self.inner.active.lock().unwrap();
            if let Some(dl) = active.get(id) {
                return Ok(Some(status::live_status(&dl.config)));
            }
        }
        {
            let queued = self.inner.queued.lock().unwrap();
            if let Some(config) = queued.iter().find(|c| c.id == id) {
                return Ok(Some(status::queued_status(config)));
            }
        }
        Ok(self
            .inner
            .store
            .get_entry(id)
            .await?
            .map(|e| status::stored_status(&e)))
    }

    /// All live and queued download configs.
    pub fn get_all(&self) -> Vec<DownloadConfig> {
        let mut out: Vec<DownloadConfig> = self
            .inner
            .active
            .lock()
            .unwrap()
            .values()
            .map(|dl| dl.config.clone())
            .collect();
        out.extend(self.inner.queued.lock().unwrap().iter().cloned());
        out
    }

    /// Whether a download for `url` is live or queued. URLs compare after
    /// trimming trailing slashes.
    pub fn has_download(&self, url: &str) -> bool {
        let wanted = url.trim_end_matches('/');
        self.get_all()
            .iter()
            .any(|c| c.url.trim_end_matches('/') == wanted)
    }

    /// Number of live downloads that have not finished.
    pub fn active_count(&self) -> usize {
        self.inner
            .active
            .lock()
            .unwrap()
            .values()
            .filter(|dl| !dl.config.progress.is_done())
            .count()
    }

    /// Ask every live download to pause.
    pub fn pause_all(&self) {
        let active = self.inner.active.lock().unwrap();
        for dl in active.values() {
            dl.config.progress.request_pause();
        }
    }

    /// Pause everything and wait for the drivers to flush state and exit.
    pub async fn graceful_shutdown(&self) {
        self.pause_all();
        let handles: Vec<_> = {
            let mut active = self.inner.active.lock().unwrap();
            active
                .values_mut()
                .filter_map(|dl| dl.handle.take())
                .collect()
        };
        for h in handles {
            let _ = h.await;
        }
    }

    /// The pool's persistent store (shared; e.g. for listing merged views).
    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    // ---- internals ----

    fn running_count(&self) -> usize {
        self.inner.active.lock().unwrap().len()
    }

    fn take_queued(&self, id: &str) -> Option<DownloadConfig> {
        let mut queued = self.inner.queued.lock().unwrap();
        let pos = queued.iter().position(|c| c.id == id)?;
        queued.remove(pos)
    }

    fn spawn_driver(&self, config: DownloadConfig) {
        let cancel = Arc::new(AtomicBool::new(false));
        let id = config.id.clone();
        // Reserve the slot before the driver runs; a driver that finishes
        // instantly must find its own entry to retire.
        self.inner.active.lock().unwrap().insert(
            id.clone(),
            ActiveDownload {
                config: config.clone(),
                cancel: Arc::clone(&cancel),
                handle: None,
            },
        );
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            driver::run(inner, config, cancel).await;
        });
        if let Some(dl) = self.inner.active.lock().unwrap().get_mut(&id) {
            dl.handle = Some(handle);
        }
    }

    /// Start queued downloads while slots are free. Called whenever a live
    /// download retires.
    pub(crate) fn promote_queued(&self) {
        while self.running_count() < self.inner.runtime.max_concurrent_downloads() {
            let Some(config) = self.inner.queued.lock().unwrap().pop_front() else {
                return;
            };
            self.spawn_driver(config);
        }
    }
}

impl PoolInner {
    /// Retire a live download and hand its slot to the next queued one.
    pub(crate) fn retire(self: &Arc<Self>, id: &str) {
        self.active.lock().unwrap().remove(id);
        let pool = DownloadPool {
            inner: Arc::clone(self),
        };
        pool.promote_queued();
    }
}
