//! Task type, chunk sizing, and range seeding.
//!
//! A task is a byte range `{offset, length}` of the output file. Tasks are
//! seeded one per chunk, shrink as workers partially complete them before a
//! failure, and split in half when the balancer needs to feed idle workers.

mod queue;

pub use queue::TaskQueue;

use serde::{Deserialize, Serialize};

/// Filesystem block alignment for chunk sizing and splits.
pub const FS_BLOCK: u64 = 4096;

/// Chunk size ceiling as a multiple of the configured minimum.
pub const MAX_CHUNK_FACTOR: u64 = 16;

/// A unit of work: byte range `[offset, offset + length)` of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub offset: u64,
    /// Always > 0 for a queued task.
    pub length: u64,
    /// Attempt counter; drives backoff when no alternate mirror exists.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempt: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Task {
    pub fn new(offset: u64, length: u64) -> Self {
        Task {
            offset,
            length,
            attempt: 0,
        }
    }

    /// End offset (exclusive).
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// HTTP Range header value (inclusive end): `bytes=offset-(end-1)`.
    pub fn range_header_value(&self) -> String {
        format!("{}-{}", self.offset, self.end().saturating_sub(1))
    }

    /// The unfinished tail after `done` bytes, with the attempt carried over.
    pub fn remainder(&self, done: u64) -> Option<Task> {
        if done >= self.length {
            return None;
        }
        Some(Task {
            offset: self.offset + done,
            length: self.length - done,
            attempt: self.attempt,
        })
    }
}

/// Initial chunk size: roughly `total / (connections * 4)`, clamped to
/// `[min_chunk, 16 * min_chunk]`, rounded down to a 4 KiB multiple, and
/// never below 4 KiB.
pub fn initial_chunk_size(total_size: u64, connections: usize, min_chunk: u64) -> u64 {
    let parts = (connections.max(1) as u64) * 4;
    let target = total_size / parts;
    let clamped = target.clamp(min_chunk, min_chunk.saturating_mul(MAX_CHUNK_FACTOR));
    let aligned = (clamped / FS_BLOCK) * FS_BLOCK;
    aligned.max(FS_BLOCK)
}

/// Number of chunks for a file of `total_size` at `chunk_size`.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> usize {
    if total_size == 0 || chunk_size == 0 {
        return 0;
    }
    ((total_size + chunk_size - 1) / chunk_size) as usize
}

/// Chunk index covering byte `offset`.
pub fn chunk_index(offset: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    (offset / chunk_size) as usize
}

/// Seed one task per not-yet-completed chunk. `completed(i)` reports chunks
/// that already live on disk (resume); a fresh download passes `|_| false`.
pub fn seed_tasks<F>(total_size: u64, chunk_size: u64, completed: F) -> Vec<Task>
where
    F: Fn(usize) -> bool,
{
    let count = chunk_count(total_size, chunk_size);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        if completed(i) {
            continue;
        }
        let offset = i as u64 * chunk_size;
        let length = chunk_size.min(total_size - offset);
        out.push(Task::new(offset, length));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_clamped_and_aligned() {
        let min = 512 * 1024;
        // Huge file: target above the ceiling.
        assert_eq!(initial_chunk_size(100 << 30, 8, min), 16 * min);
        // Tiny file: floor at min_chunk.
        assert_eq!(initial_chunk_size(10, 8, min), min);
        // Mid-range target gets 4 KiB alignment.
        let sz = initial_chunk_size(100_000_000, 8, min);
        assert_eq!(sz % FS_BLOCK, 0);
        assert!(sz >= min && sz <= 16 * min);
    }

    #[test]
    fn chunk_size_never_below_fs_block() {
        assert_eq!(initial_chunk_size(100, 4, 1), FS_BLOCK);
    }

    #[test]
    fn seed_tasks_cover_file_disjoint() {
        let total = 1_048_576u64;
        let chunk = 4096 * 37;
        let tasks = seed_tasks(total, chunk, |_| false);
        assert_eq!(tasks.len(), chunk_count(total, chunk));
        let mut next = 0u64;
        for t in &tasks {
            assert_eq!(t.offset, next);
            assert!(t.length > 0);
            next = t.end();
        }
        assert_eq!(next, total);
    }

    #[test]
    fn seed_tasks_skips_completed_chunks() {
        let tasks = seed_tasks(4096 * 4, 4096, |i| i % 2 == 0);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].offset, 4096);
        assert_eq!(tasks[1].offset, 4096 * 3);
    }

    #[test]
    fn seed_tasks_zero_size_empty() {
        assert!(seed_tasks(0, 4096, |_| false).is_empty());
    }

    #[test]
    fn task_remainder_and_range_header() {
        let t = Task::new(100, 50);
        assert_eq!(t.range_header_value(), "100-149");
        let r = t.remainder(20).unwrap();
        assert_eq!(r.offset, 120);
        assert_eq!(r.length, 30);
        assert!(t.remainder(50).is_none());
        assert!(t.remainder(60).is_none());
    }
}
