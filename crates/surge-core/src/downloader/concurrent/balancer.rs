//! Balancer: halve the largest queued task while workers sit idle.
//!
//! Keeps the long tail parallel: near the end of a download most tasks are
//! done and idle workers would otherwise watch one worker crawl through the
//! last big range. The split count is capped per run; past the cap the
//! queue simply drains as-is.

use std::sync::atomic::Ordering;
use std::time::Duration;

use super::EngineShared;

const BALANCE_INTERVAL: Duration = Duration::from_millis(500);
/// Split ceiling per engine run.
pub(crate) const MAX_SPLITS: u32 = 50;

pub(super) fn run(shared: &EngineShared) {
    let mut splits = 0u32;
    loop {
        if shared.queue.is_closed()
            || shared.cancel.load(Ordering::SeqCst)
            || shared.cfg.progress.is_paused()
        {
            return;
        }
        std::thread::sleep(BALANCE_INTERVAL);

        while splits < MAX_SPLITS && shared.queue.idle_workers() > 0 {
            if shared.queue.split_largest_if_needed() {
                splits += 1;
                tracing::trace!("balancer split {}/{}", splits, MAX_SPLITS);
            } else {
                break;
            }
        }
    }
}
