//! Mirror rotation with per-mirror health state.
//!
//! A download starts with `{primary} ∪ mirrors`, each active. Workers pick
//! mirrors round-robin among the healthy ones; a mirror that fails a task is
//! benched for a cooldown rather than disabled outright, so transient errors
//! don't permanently shrink the set. `probe_mirrors` failures at setup
//! disable a mirror for the whole run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cooldown applied to a mirror after a failed task.
pub const MIRROR_BENCH_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Mirror {
    url: String,
    disabled: bool,
    benched_until: Option<Instant>,
}

impl Mirror {
    fn healthy(&self, now: Instant) -> bool {
        !self.disabled && self.benched_until.map(|t| now >= t).unwrap_or(true)
    }
}

/// Shared mirror set for one download. All methods take `&self`; internal
/// state is guarded by a mutex held only for list bookkeeping.
#[derive(Debug)]
pub struct MirrorSet {
    mirrors: Mutex<Vec<Mirror>>,
    cursor: AtomicUsize,
}

impl MirrorSet {
    /// Build from the primary URL plus optional mirrors; duplicates are
    /// dropped, primary first.
    pub fn new(primary: &str, mirrors: &[String]) -> Self {
        let mut urls: Vec<String> = vec![primary.to_string()];
        for m in mirrors {
            if !urls.iter().any(|u| u == m) {
                urls.push(m.clone());
            }
        }
        MirrorSet {
            mirrors: Mutex::new(
                urls.into_iter()
                    .map(|url| Mirror {
                        url,
                        disabled: false,
                        benched_until: None,
                    })
                    .collect(),
            ),
            cursor: AtomicUsize::new(0),
        }
    }

    /// All URLs in rotation order (for persistence), including disabled ones.
    pub fn urls(&self) -> Vec<String> {
        self.mirrors
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.url.clone())
            .collect()
    }

    /// Round-robin pick among healthy mirrors. When everything is benched,
    /// falls back to the first non-disabled mirror so a download with a
    /// flapping single source still makes attempts.
    pub fn pick(&self) -> Option<String> {
        let now = Instant::now();
        let mirrors = self.mirrors.lock().unwrap();
        if mirrors.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..mirrors.len() {
            let m = &mirrors[(start + i) % mirrors.len()];
            if m.healthy(now) {
                return Some(m.url.clone());
            }
        }
        mirrors.iter().find(|m| !m.disabled).map(|m| m.url.clone())
    }

    /// Bench `url` for [`MIRROR_BENCH_COOLDOWN`] after a failed task.
    pub fn bench(&self, url: &str) {
        let until = Instant::now() + MIRROR_BENCH_COOLDOWN;
        let mut mirrors = self.mirrors.lock().unwrap();
        if let Some(m) = mirrors.iter_mut().find(|m| m.url == url) {
            m.benched_until = Some(until);
        }
    }

    /// Disable `url` for the rest of the run (failed setup probe).
    pub fn disable(&self, url: &str) {
        let mut mirrors = self.mirrors.lock().unwrap();
        if let Some(m) = mirrors.iter_mut().find(|m| m.url == url) {
            m.disabled = true;
        }
    }

    /// Number of non-disabled mirrors, benched or not.
    pub fn active_count(&self) -> usize {
        self.mirrors
            .lock()
            .unwrap()
            .iter()
            .filter(|m| !m.disabled)
            .count()
    }

    /// True when a healthy mirror other than `failed_url` exists right now.
    /// Decides between immediate failover and exponential backoff.
    pub fn has_alternative(&self, failed_url: &str) -> bool {
        let now = Instant::now();
        self.mirrors
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.url != failed_url && m.healthy(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_and_primary_first() {
        let set = MirrorSet::new(
            "http://a/",
            &["http://b/".to_string(), "http://a/".to_string()],
        );
        assert_eq!(set.urls(), vec!["http://a/", "http://b/"]);
        assert_eq!(set.active_count(), 2);
    }

    #[test]
    fn round_robin_covers_all_mirrors() {
        let set = MirrorSet::new("http://a/", &["http://b/".to_string()]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            seen.insert(set.pick().unwrap());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn benched_mirror_skipped_until_cooldown() {
        let set = MirrorSet::new("http://a/", &["http://b/".to_string()]);
        set.bench("http://a/");
        for _ in 0..4 {
            assert_eq!(set.pick().unwrap(), "http://b/");
        }
        assert!(!set.has_alternative("http://b/"));
        assert!(set.has_alternative("http://a/"));
    }

    #[test]
    fn all_benched_falls_back_to_first_active() {
        let set = MirrorSet::new("http://a/", &[]);
        set.bench("http://a/");
        assert_eq!(set.pick().unwrap(), "http://a/");
        assert!(!set.has_alternative("http://a/"));
    }

    #[test]
    fn disabled_mirror_out_of_rotation() {
        let set = MirrorSet::new("http://a/", &["http://b/".to_string()]);
        set.disable("http://b/");
        assert_eq!(set.active_count(), 1);
        for _ in 0..4 {
            assert_eq!(set.pick().unwrap(), "http://a/");
        }
    }
}
