//! Health monitor: restart slow and stalled workers.
//!
//! Tracks an exponentially-smoothed per-worker speed. Once a worker's grace
//! period is over, an EMA below `slow_worker_threshold × mean` flags it for
//! restart; so does producing no bytes for `stall_timeout`. A restart just
//! aborts the in-flight transfer — the worker re-enqueues its remainder and
//! pops fresh work, usually landing on a different mirror.

use std::sync::atomic::Ordering;
use std::time::Instant;

use super::EngineShared;

pub(super) fn run(shared: &EngineShared) {
    let runtime = &shared.cfg.runtime;
    let interval = runtime.health_check_interval();
    let alpha = runtime.speed_ema_alpha();
    let threshold = runtime.slow_worker_threshold();
    let grace = runtime.slow_worker_grace();
    let stall_ms = runtime.stall_timeout().as_millis() as u64;

    let n = shared.slots.len();
    let mut prev_bytes = vec![0u64; n];
    let mut emas = vec![0f64; n];
    let mut grace_until = vec![Instant::now() + grace; n];

    loop {
        if shared.queue.is_closed()
            || shared.cancel.load(Ordering::SeqCst)
            || shared.cfg.progress.is_paused()
        {
            return;
        }
        std::thread::sleep(interval);
        let now = Instant::now();
        let secs = interval.as_secs_f64();

        for i in 0..n {
            let cur = shared.slots[i].bytes.load(Ordering::Relaxed);
            let delta = cur.saturating_sub(prev_bytes[i]);
            prev_bytes[i] = cur;
            emas[i] = ema_update(emas[i], delta as f64 / secs, alpha);
        }

        let busy: Vec<usize> = (0..n)
            .filter(|&i| shared.slots[i].busy.load(Ordering::Relaxed))
            .collect();

        // Relative slowness needs at least two samples to compare.
        if busy.len() >= 2 {
            let mean = busy.iter().map(|&i| emas[i]).sum::<f64>() / busy.len() as f64;
            for &i in &busy {
                if now >= grace_until[i] && is_slow(emas[i], mean, threshold) {
                    tracing::debug!(
                        "restarting slow worker {} (ema {:.0} B/s vs mean {:.0})",
                        i,
                        emas[i],
                        mean
                    );
                    restart_slot(shared, i, &mut emas, &mut grace_until, now, grace);
                }
            }
        }

        let now_ms = shared.elapsed_ms();
        for &i in &busy {
            let last = shared.slots[i].last_progress_ms.load(Ordering::Relaxed);
            if now_ms.saturating_sub(last) >= stall_ms {
                tracing::debug!("restarting stalled worker {}", i);
                restart_slot(shared, i, &mut emas, &mut grace_until, now, grace);
            }
        }
    }
}

fn restart_slot(
    shared: &EngineShared,
    i: usize,
    emas: &mut [f64],
    grace_until: &mut [Instant],
    now: Instant,
    grace: std::time::Duration,
) {
    shared.slots[i].restart.store(true, Ordering::Relaxed);
    shared.slots[i]
        .last_progress_ms
        .store(shared.elapsed_ms(), Ordering::Relaxed);
    emas[i] = 0.0;
    grace_until[i] = now + grace;
}

/// Seed the EMA with the first sample instead of dragging it up from zero.
pub(crate) fn ema_update(prev: f64, sample: f64, alpha: f64) -> f64 {
    if prev == 0.0 {
        sample
    } else {
        alpha * sample + (1.0 - alpha) * prev
    }
}

/// A worker is slow when its EMA sits below the threshold fraction of the
/// busy-worker mean.
pub(crate) fn is_slow(ema: f64, mean: f64, threshold: f64) -> bool {
    mean > 0.0 && ema < threshold * mean
}
