//! Worker loop: pop a task, pick a mirror, stream the range to disk.
//!
//! The transfer handler validates `206`/`200` before the first write, does
//! positional writes at `offset + bytes_read`, and carries the cooperative
//! abort checks (cancel, pause, monitor-requested restart) in both the
//! write and progress callbacks. On failure the unfinished remainder goes
//! back on the queue: immediately when another healthy mirror exists,
//! after `2^attempt × 200 ms` when the failing source is the only one left.

use curl::easy::{Easy2, Handler, WriteError};
use std::str;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::task::Task;

use super::super::client;
use super::EngineShared;

/// Base unit of the lone-source backoff.
const BACKOFF_UNIT: Duration = Duration::from_millis(200);
/// Granularity of interruptible sleeps (backoff must notice pause/cancel).
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
enum AbortReason {
    Cancelled,
    Paused,
    Restart,
    /// Transfer reached the task's byte budget (200 responses over-deliver).
    LimitReached,
    BadStatus(u32),
    BadResponse(String),
    /// Filesystem write failure; fatal for the whole download.
    Io(String),
}

enum FetchOutcome {
    Done,
    /// Pause or cancel: push the remainder and leave the loop.
    Unwind(Option<Task>),
    /// Monitor restart: push the remainder and keep working.
    Restart(Option<Task>),
    Errored {
        remainder: Task,
        mirror: String,
        message: String,
    },
    Fatal(String),
}

pub(super) fn worker_loop(shared: Arc<EngineShared>, slot_idx: usize) {
    let progress = &shared.cfg.progress;
    progress.worker_started();

    while let Some(task) = shared.queue.pop() {
        if shared.cancel.load(Ordering::SeqCst) || progress.is_paused() {
            shared.queue.push(task);
            shared.queue.task_done();
            break;
        }

        let slot = &shared.slots[slot_idx];
        slot.busy.store(true, Ordering::Relaxed);
        slot.last_progress_ms.store(shared.elapsed_ms(), Ordering::Relaxed);
        let outcome = fetch_task(&shared, slot_idx, task);
        slot.busy.store(false, Ordering::Relaxed);

        match outcome {
            FetchOutcome::Done => {
                shared.queue.task_done();
            }
            FetchOutcome::Unwind(remainder) => {
                if let Some(r) = remainder {
                    shared.queue.push(r);
                }
                shared.queue.task_done();
                break;
            }
            FetchOutcome::Restart(remainder) => {
                slot.restart.store(false, Ordering::Relaxed);
                if let Some(r) = remainder {
                    shared.queue.push(r);
                }
                shared.queue.task_done();
            }
            FetchOutcome::Errored {
                remainder,
                mirror,
                message,
            } => {
                let mirrors = progress.mirrors();
                mirrors.bench(&mirror);
                let mut next = remainder;
                next.attempt += 1;
                tracing::debug!(
                    "task {}+{} attempt {} failed via {}: {}",
                    next.offset,
                    next.length,
                    next.attempt,
                    mirror,
                    message
                );

                if next.attempt > shared.cfg.runtime.max_task_retries() {
                    shared.raise_fatal(format!(
                        "task at offset {} failed after {} attempts: {}",
                        next.offset, next.attempt, message
                    ));
                    shared.queue.task_done();
                    break;
                }

                if mirrors.has_alternative(&mirror) {
                    // Another source can serve the range right now.
                    shared.queue.push(next);
                    shared.queue.task_done();
                } else {
                    let backoff = BACKOFF_UNIT
                        .saturating_mul(1u32 << next.attempt.min(10));
                    let interrupted = !sleep_interruptible(&shared, backoff);
                    shared.queue.push(next);
                    shared.queue.task_done();
                    if interrupted {
                        break;
                    }
                }
            }
            FetchOutcome::Fatal(message) => {
                shared.raise_fatal(message);
                shared.queue.task_done();
                break;
            }
        }
    }

    progress.worker_stopped();
}

/// Sleep in slices so pause/cancel cuts the backoff short. Returns false
/// when interrupted.
fn sleep_interruptible(shared: &EngineShared, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if shared.cancel.load(Ordering::SeqCst) || shared.cfg.progress.is_paused() {
            return false;
        }
        let slice = remaining.min(SLEEP_SLICE);
        std::thread::sleep(slice);
        remaining -= slice;
    }
    true
}

fn fetch_task(shared: &Arc<EngineShared>, slot_idx: usize, task: Task) -> FetchOutcome {
    let mirror = shared
        .cfg
        .progress
        .mirrors()
        .pick()
        .unwrap_or_else(|| shared.cfg.url.clone());

    let handler = TransferHandler {
        shared: Arc::clone(shared),
        slot: slot_idx,
        task,
        written: 0,
        status: None,
        range_start: None,
        checked: false,
        abort: None,
    };
    let mut easy = Easy2::new(handler);
    let range = task.range_header_value();
    if let Err(e) = client::configure(
        &mut easy,
        &mirror,
        &shared.cfg.headers,
        &shared.cfg.runtime,
        Some(&range),
    ) {
        return FetchOutcome::Errored {
            remainder: task,
            mirror,
            message: e.to_string(),
        };
    }

    let performed = easy.perform();
    let (abort, written) = {
        let h = easy.get_ref();
        (h.abort.clone(), h.written)
    };
    let remainder = task.remainder(written);

    match abort {
        Some(AbortReason::Io(msg)) => FetchOutcome::Fatal(msg),
        Some(AbortReason::Cancelled) | Some(AbortReason::Paused) => {
            FetchOutcome::Unwind(remainder)
        }
        Some(AbortReason::Restart) => FetchOutcome::Restart(remainder),
        Some(AbortReason::LimitReached) => {
            debug_assert!(written == task.length);
            FetchOutcome::Done
        }
        Some(AbortReason::BadStatus(code)) => FetchOutcome::Errored {
            remainder: remainder.unwrap_or(task),
            mirror,
            message: format!("HTTP {}", code),
        },
        Some(AbortReason::BadResponse(msg)) => FetchOutcome::Errored {
            remainder: remainder.unwrap_or(task),
            mirror,
            message: msg,
        },
        None => {
            if written == task.length {
                return FetchOutcome::Done;
            }
            let message = match performed {
                Ok(()) => format!(
                    "short response: {} of {} bytes",
                    written, task.length
                ),
                Err(e) => e.to_string(),
            };
            match remainder {
                Some(remainder) => FetchOutcome::Errored {
                    remainder,
                    mirror,
                    message,
                },
                // written == length can't reach here; belt for the compiler.
                None => FetchOutcome::Done,
            }
        }
    }
}

struct TransferHandler {
    shared: Arc<EngineShared>,
    slot: usize,
    task: Task,
    written: u64,
    status: Option<u32>,
    /// Start offset from `Content-Range`, for 206 validation.
    range_start: Option<u64>,
    checked: bool,
    abort: Option<AbortReason>,
}

impl TransferHandler {
    fn check_flags(&self) -> Option<AbortReason> {
        if self.shared.cancel.load(Ordering::SeqCst) {
            return Some(AbortReason::Cancelled);
        }
        if self.shared.cfg.progress.is_paused() {
            return Some(AbortReason::Paused);
        }
        if self.shared.slots[self.slot].restart.load(Ordering::Relaxed) {
            return Some(AbortReason::Restart);
        }
        None
    }

    /// Validate the response class once, before the first byte lands.
    fn classify_response(&self) -> Option<AbortReason> {
        match self.status {
            Some(206) => {
                if let Some(start) = self.range_start {
                    if start != self.task.offset {
                        return Some(AbortReason::BadResponse(format!(
                            "content-range starts at {}, task at {}",
                            start, self.task.offset
                        )));
                    }
                }
                None
            }
            // A 200 is the whole file from byte 0; only a task anchored
            // there can use it (reading stops at the task's length).
            Some(200) => {
                if self.task.offset != 0 {
                    Some(AbortReason::BadResponse(
                        "server ignored range request".to_string(),
                    ))
                } else {
                    None
                }
            }
            Some(code) => Some(AbortReason::BadStatus(code)),
            None => Some(AbortReason::BadResponse("missing status line".to_string())),
        }
    }
}

impl Handler for TransferHandler {
    fn header(&mut self, data: &[u8]) -> bool {
        if let Ok(s) = str::from_utf8(data) {
            let line = s.trim_end();
            if line.starts_with("HTTP/") {
                // New hop: earlier redirect headers no longer apply.
                self.status = line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|c| c.parse::<u32>().ok());
                self.range_start = None;
                self.checked = false;
            } else if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-range") {
                    // "bytes S-E/T"
                    self.range_start = value
                        .trim()
                        .strip_prefix("bytes ")
                        .and_then(|v| v.split('-').next())
                        .and_then(|s| s.trim().parse::<u64>().ok());
                }
            }
        }
        true
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if let Some(reason) = self.check_flags() {
            self.abort = Some(reason);
            return Ok(0);
        }
        if !self.checked {
            self.checked = true;
            if let Some(reason) = self.classify_response() {
                self.abort = Some(reason);
                return Ok(0);
            }
        }

        let remaining = self.task.length - self.written;
        if remaining == 0 {
            self.abort = Some(AbortReason::LimitReached);
            return Ok(0);
        }
        let take = (data.len() as u64).min(remaining) as usize;
        let offset = self.task.offset + self.written;
        if let Err(e) = self.shared.file.write_at(offset, &data[..take]) {
            self.abort = Some(AbortReason::Io(e.to_string()));
            return Ok(0);
        }

        self.written += take as u64;
        self.shared.cfg.progress.record_write(offset, take as u64);
        let slot = &self.shared.slots[self.slot];
        slot.bytes.fetch_add(take as u64, Ordering::Relaxed);
        slot.last_progress_ms
            .store(self.shared.elapsed_ms(), Ordering::Relaxed);

        if take < data.len() {
            // Over-delivery (200 full-file response); stop at the budget.
            self.abort = Some(AbortReason::LimitReached);
            return Ok(0);
        }
        Ok(data.len())
    }

    fn progress(&mut self, _dltotal: f64, _dlnow: f64, _ultotal: f64, _ulnow: f64) -> bool {
        if self.abort.is_some() {
            return false;
        }
        if let Some(reason) = self.check_flags() {
            self.abort = Some(reason);
            return false;
        }
        true
    }
}
