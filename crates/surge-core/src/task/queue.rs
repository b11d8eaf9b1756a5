//! Thread-safe work queue for download tasks.
//!
//! A monitor (mutex + condvar): `pop` blocks until work arrives or the queue
//! closes, `push` wakes waiters, and an atomic idle census tells the
//! balancer how many workers are starved. The queue also tracks in-flight
//! tasks so it can close itself once every byte range is spoken for.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use super::{Task, FS_BLOCK};

#[derive(Debug, Default)]
struct QueueInner {
    tasks: VecDeque<Task>,
    in_flight: usize,
    closed: bool,
}

/// Work queue shared by the workers, the balancer, and the driver.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
    idle_workers: AtomicUsize,
    min_chunk: u64,
}

impl TaskQueue {
    pub fn new(min_chunk: u64) -> Self {
        TaskQueue {
            inner: Mutex::new(QueueInner::default()),
            cond: Condvar::new(),
            idle_workers: AtomicUsize::new(0),
            min_chunk,
        }
    }

    /// Append one task and wake a waiter. Also legal after close: an
    /// unwinding worker parks its remainder here so pause/error snapshots
    /// keep every byte range.
    pub fn push(&self, task: Task) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.push_back(task);
        self.cond.notify_one();
    }

    /// Append many tasks and wake all waiters.
    pub fn push_many(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.extend(tasks);
        self.cond.notify_all();
    }

    /// Block until a task is available or the queue closes. Returns `None`
    /// on close. The idle census covers the waiting span only.
    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(task) = inner.tasks.pop_front() {
                inner.in_flight += 1;
                return Some(task);
            }
            if inner.closed {
                return None;
            }
            self.idle_workers.fetch_add(1, Ordering::Relaxed);
            inner = self.cond.wait(inner).unwrap();
            self.idle_workers.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Mark a popped task as no longer in flight. When nothing is queued and
    /// nothing is in flight the file is fully covered, so the queue closes
    /// and the workers drain out.
    ///
    /// A worker that re-enqueues a remainder must `push` it *before* calling
    /// this, otherwise the queue can close under it.
    pub fn task_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if inner.in_flight == 0 && inner.tasks.is_empty() && !inner.closed {
            inner.closed = true;
            self.cond.notify_all();
        }
    }

    /// Close the queue and wake all waiters; subsequent `pop`s return `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Number of workers currently blocked in `pop`.
    pub fn idle_workers(&self) -> usize {
        self.idle_workers.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the queued tasks, for persistence at pause time.
    pub fn snapshot(&self) -> Vec<Task> {
        self.inner.lock().unwrap().tasks.iter().copied().collect()
    }

    /// Split the largest queued task in half so an idle worker has something
    /// to chew on. The split point is rounded down to a 4 KiB boundary and
    /// the split is abandoned if either half would fall below the minimum
    /// chunk size. Returns whether a split happened.
    pub fn split_largest_if_needed(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        let Some(idx) = inner
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.length > 2 * self.min_chunk)
            .max_by_key(|(_, t)| t.length)
            .map(|(i, _)| i)
        else {
            return false;
        };
        let task = inner.tasks[idx];
        let half = (task.length / 2 / FS_BLOCK) * FS_BLOCK;
        if half < self.min_chunk || task.length - half < self.min_chunk {
            return false;
        }
        inner.tasks[idx] = Task::new(task.offset, half);
        inner
            .tasks
            .insert(idx + 1, Task::new(task.offset + half, task.length - half));
        // Two halves may feed two workers.
        self.cond.notify_all();
        true
    }
}
