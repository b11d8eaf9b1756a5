//! Shared in-memory state for a live download.
//!
//! One `ProgressState` per download, shared between the pool, the event
//! emitter, and every worker thread. Byte counters and flags are atomics;
//! the chunk bitmap and per-chunk progress map sit behind short critical
//! sections that are never held across I/O.

mod bitmap;
mod mirrors;

pub use bitmap::{ChunkBitmap, ChunkState};
pub use mirrors::{MirrorSet, MIRROR_BENCH_COOLDOWN};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::task::Task;

/// Live state of one download. Invariants:
/// `downloaded >= verified`, both monotonically non-decreasing within a run;
/// completed bitmap entries never revert.
pub struct ProgressState {
    downloaded: AtomicU64,
    /// Committed-to-disk watermark: bytes belonging to completed chunks.
    verified: AtomicU64,
    total_size: AtomicU64,
    active_workers: AtomicUsize,
    /// Latest sampled speed in bytes/sec, written by the progress emitter.
    speed_bps: AtomicU64,
    paused: AtomicBool,
    done: AtomicBool,
    /// Set once `Started` has been emitted; gates the progress ticker.
    started: AtomicBool,
    session_start: Mutex<Instant>,
    /// Elapsed accumulated across previous sessions, in milliseconds.
    elapsed_before_ms: AtomicU64,
    chunk_size: AtomicU64,
    bitmap: Mutex<ChunkBitmap>,
    /// Bytes downloaded within each not-yet-complete chunk.
    chunk_progress: Mutex<HashMap<u32, u64>>,
    mirrors: MirrorSet,
}

impl ProgressState {
    pub fn new(primary_url: &str, mirror_urls: &[String]) -> Self {
        ProgressState {
            downloaded: AtomicU64::new(0),
            verified: AtomicU64::new(0),
            total_size: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            speed_bps: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            done: AtomicBool::new(false),
            started: AtomicBool::new(false),
            session_start: Mutex::new(Instant::now()),
            elapsed_before_ms: AtomicU64::new(0),
            chunk_size: AtomicU64::new(0),
            bitmap: Mutex::new(ChunkBitmap::default()),
            chunk_progress: Mutex::new(HashMap::new()),
            mirrors: MirrorSet::new(primary_url, mirror_urls),
        }
    }

    // Byte counters.

    pub fn add_downloaded(&self, n: u64) {
        self.downloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Restore the counter at resume time, before any worker runs. The
    /// verified watermark is rebuilt separately from the bitmap.
    pub fn set_downloaded(&self, n: u64) {
        self.downloaded.store(n, Ordering::Relaxed);
    }

    pub fn add_verified(&self, n: u64) {
        self.verified.fetch_add(n, Ordering::Relaxed);
    }

    pub fn verified(&self) -> u64 {
        self.verified.load(Ordering::Relaxed)
    }

    pub fn set_total_size(&self, n: u64) {
        self.total_size.store(n, Ordering::Relaxed);
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    // Worker census and sampled speed.

    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_stopped(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    pub fn set_speed(&self, bytes_per_sec: u64) {
        self.speed_bps.store(bytes_per_sec, Ordering::Relaxed);
    }

    pub fn speed(&self) -> u64 {
        self.speed_bps.load(Ordering::Relaxed)
    }

    // Pause / done flags.

    pub fn request_pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn clear_pause(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    // Session timing.

    /// Start (or restart after resume) the wall clock for this session.
    pub fn start_session(&self) {
        *self.session_start.lock().unwrap() = Instant::now();
    }

    /// Restore elapsed time carried over from previous sessions.
    pub fn set_elapsed_before_ms(&self, ms: u64) {
        self.elapsed_before_ms.store(ms, Ordering::Relaxed);
    }

    /// Total elapsed in ms: previous sessions plus the current one.
    pub fn elapsed_ms(&self) -> u64 {
        let session = self.session_start.lock().unwrap().elapsed().as_millis() as u64;
        self.elapsed_before_ms.load(Ordering::Relaxed) + session
    }

    // Chunk accounting.

    pub fn set_chunk_size(&self, n: u64) {
        self.chunk_size.store(n, Ordering::Relaxed);
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size.load(Ordering::Relaxed)
    }

    /// Install the bitmap (at setup or resume).
    pub fn set_bitmap(&self, bitmap: ChunkBitmap) {
        *self.bitmap.lock().unwrap() = bitmap;
    }

    pub fn bitmap_bytes(&self) -> Vec<u8> {
        self.bitmap.lock().unwrap().to_bytes()
    }

    /// Transition one chunk's state; completed entries never revert.
    pub fn set_chunk_state(&self, index: usize, state: ChunkState) {
        self.bitmap.lock().unwrap().set(index, state);
    }

    pub fn chunk_state(&self, index: usize) -> ChunkState {
        self.bitmap.lock().unwrap().get(index)
    }

    pub fn all_chunks_completed(&self) -> bool {
        self.bitmap.lock().unwrap().all_completed()
    }

    /// Promote completed chunks to verified after an fsync.
    pub fn mark_bitmap_verified(&self) {
        self.bitmap.lock().unwrap().mark_all_verified();
    }

    /// Record bytes downloaded inside a partially-complete chunk.
    pub fn note_chunk_progress(&self, chunk: u32, bytes: u64) {
        self.chunk_progress.lock().unwrap().insert(chunk, bytes);
    }

    /// Drop a chunk's partial counter once the chunk completes.
    pub fn clear_chunk_progress(&self, chunk: u32) {
        self.chunk_progress.lock().unwrap().remove(&chunk);
    }

    pub fn chunk_progress_snapshot(&self) -> HashMap<u32, u64> {
        self.chunk_progress.lock().unwrap().clone()
    }

    pub fn mirrors(&self) -> &MirrorSet {
        &self.mirrors
    }

    /// Account for `len` bytes just written at `offset`: bump `downloaded`,
    /// advance the per-chunk byte counts, and drive bitmap transitions
    /// (pending → downloading → completed at the chunk boundary). A chunk
    /// that fills up also advances the `verified` watermark.
    ///
    /// With no chunk layout installed (single-stream downloads) only the
    /// byte counter moves.
    pub fn record_write(&self, offset: u64, len: u64) {
        self.add_downloaded(len);
        let chunk_size = self.chunk_size();
        if chunk_size == 0 || len == 0 {
            return;
        }
        let total = self.total_size();
        let end = offset + len;
        let mut idx = (offset / chunk_size) as usize;
        loop {
            let chunk_start = idx as u64 * chunk_size;
            let chunk_end = (chunk_start + chunk_size).min(total);
            let chunk_len = chunk_end - chunk_start;
            let span_start = offset.max(chunk_start);
            let span_end = end.min(chunk_end);
            if span_start >= span_end {
                break;
            }
            let filled = {
                let mut map = self.chunk_progress.lock().unwrap();
                let c = map.entry(idx as u32).or_insert(0);
                *c += span_end - span_start;
                *c >= chunk_len
            };
            if filled {
                self.set_chunk_state(idx, ChunkState::Completed);
                self.clear_chunk_progress(idx as u32);
                self.add_verified(chunk_len);
            } else if self.chunk_state(idx) == ChunkState::Pending {
                self.set_chunk_state(idx, ChunkState::Downloading);
            }
            if span_end >= end {
                break;
            }
            idx += 1;
        }
    }

    /// Rebuild per-chunk byte counts from a persisted remainder task list at
    /// resume time, so partially-written chunks can still reach completion.
    /// A non-completed chunk no task covers is fully on disk already and is
    /// promoted to completed.
    pub fn prime_resume_accounting(&self, tasks: &[Task]) {
        let chunk_size = self.chunk_size();
        if chunk_size == 0 {
            return;
        }
        let total = self.total_size();
        let count = crate::task::chunk_count(total, chunk_size);
        let mut remaining = vec![0u64; count];
        for t in tasks {
            let mut idx = (t.offset / chunk_size) as usize;
            let end = t.end();
            loop {
                let chunk_start = idx as u64 * chunk_size;
                let chunk_end = (chunk_start + chunk_size).min(total);
                let span = end.min(chunk_end).saturating_sub(t.offset.max(chunk_start));
                if span == 0 {
                    break;
                }
                if idx < count {
                    remaining[idx] += span;
                }
                if end <= chunk_end {
                    break;
                }
                idx += 1;
            }
        }
        for idx in 0..count {
            if self.chunk_state(idx) >= ChunkState::Completed {
                continue;
            }
            let chunk_start = idx as u64 * chunk_size;
            let chunk_len = ((chunk_start + chunk_size).min(total)) - chunk_start;
            let done = chunk_len.saturating_sub(remaining[idx]);
            if done == chunk_len {
                self.set_chunk_state(idx, ChunkState::Completed);
            } else if done > 0 {
                self.note_chunk_progress(idx as u32, done);
            }
        }
        self.recompute_verified();
    }

    /// Rebuild the verified watermark as the byte total of completed chunks.
    pub fn recompute_verified(&self) {
        let chunk_size = self.chunk_size();
        if chunk_size == 0 {
            return;
        }
        let total = self.total_size();
        let count = crate::task::chunk_count(total, chunk_size);
        let mut verified = 0u64;
        for idx in 0..count {
            if self.chunk_state(idx) >= ChunkState::Completed {
                let chunk_start = idx as u64 * chunk_size;
                verified += ((chunk_start + chunk_size).min(total)) - chunk_start;
            }
        }
        self.verified.store(verified, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_monotonic_and_invariant() {
        let p = ProgressState::new("http://a/", &[]);
        p.add_downloaded(100);
        p.add_downloaded(50);
        assert_eq!(p.downloaded(), 150);
        p.add_verified(100);
        assert!(p.downloaded() >= p.verified());
    }

    #[test]
    fn resume_restores_counters() {
        let p = ProgressState::new("http://a/", &[]);
        p.set_downloaded(4096);
        assert_eq!(p.downloaded(), 4096);
        assert_eq!(p.verified(), 0);
    }

    #[test]
    fn record_write_completes_chunks_and_verifies() {
        let p = ProgressState::new("http://a/", &[]);
        p.set_total_size(10_000);
        p.set_chunk_size(4096);
        p.set_bitmap(ChunkBitmap::new(3));

        p.record_write(0, 1000);
        assert_eq!(p.downloaded(), 1000);
        assert_eq!(p.chunk_state(0), ChunkState::Downloading);
        assert_eq!(p.verified(), 0);

        p.record_write(1000, 3096);
        assert_eq!(p.chunk_state(0), ChunkState::Completed);
        assert_eq!(p.verified(), 4096);
        assert!(p.chunk_progress_snapshot().is_empty());

        // Spanning write covers chunk 1 fully and part of the short chunk 2.
        p.record_write(4096, 5000);
        assert_eq!(p.chunk_state(1), ChunkState::Completed);
        assert_eq!(p.chunk_state(2), ChunkState::Downloading);
        assert_eq!(p.verified(), 8192);
        p.record_write(9096, 904);
        assert_eq!(p.chunk_state(2), ChunkState::Completed);
        assert_eq!(p.verified(), 10_000);
        assert_eq!(p.downloaded(), 10_000);
    }

    #[test]
    fn prime_resume_accounting_rebuilds_partials() {
        let p = ProgressState::new("http://a/", &[]);
        p.set_total_size(12_288);
        p.set_chunk_size(4096);
        let mut bitmap = ChunkBitmap::new(3);
        bitmap.set(0, ChunkState::Completed);
        p.set_bitmap(bitmap);
        p.set_downloaded(4096 + 1000);

        // Chunk 1 has 1000 bytes on disk; chunk 2 untouched.
        let tasks = vec![Task::new(4096 + 1000, 4096 - 1000), Task::new(8192, 4096)];
        p.prime_resume_accounting(&tasks);
        assert_eq!(p.chunk_progress_snapshot().get(&1), Some(&1000));
        assert_eq!(p.verified(), 4096);

        // Finishing chunk 1's remainder completes it.
        p.record_write(4096 + 1000, 4096 - 1000);
        assert_eq!(p.chunk_state(1), ChunkState::Completed);
        assert_eq!(p.verified(), 8192);
    }

    #[test]
    fn pause_and_done_flags() {
        let p = ProgressState::new("http://a/", &[]);
        assert!(!p.is_paused());
        p.request_pause();
        assert!(p.is_paused());
        p.clear_pause();
        assert!(!p.is_paused());
        p.set_done();
        assert!(p.is_done());
    }

    #[test]
    fn elapsed_accumulates_across_sessions() {
        let p = ProgressState::new("http://a/", &[]);
        p.set_elapsed_before_ms(5_000);
        p.start_session();
        assert!(p.elapsed_ms() >= 5_000);
    }

    #[test]
    fn chunk_progress_map_tracks_partials() {
        let p = ProgressState::new("http://a/", &[]);
        p.note_chunk_progress(3, 1024);
        p.note_chunk_progress(3, 2048);
        assert_eq!(p.chunk_progress_snapshot().get(&3), Some(&2048));
        p.clear_chunk_progress(3);
        assert!(p.chunk_progress_snapshot().is_empty());
    }
}
