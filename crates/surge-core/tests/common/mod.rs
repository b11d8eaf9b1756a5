pub mod range_server;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use surge_core::config::RuntimeConfig;
use surge_core::events::{self, DownloadEvent};
use surge_core::pool::{DownloadPool, DownloadRequest};
use surge_core::store::StateStore;
use tokio::sync::mpsc::Receiver;

/// Pool wired to an in-memory store and a roomy event buffer.
pub async fn test_pool(runtime: RuntimeConfig) -> (DownloadPool, Receiver<DownloadEvent>) {
    let store = StateStore::open_memory().await.expect("open store");
    let (events, rx) = events::channel(1024);
    let pool = DownloadPool::new(store, Arc::new(runtime), events);
    (pool, rx)
}

pub fn request(url: &str, dir: &Path) -> DownloadRequest {
    DownloadRequest {
        url: url.to_string(),
        mirrors: Vec::new(),
        output_dir: dir.to_path_buf(),
        filename: None,
        headers: HashMap::new(),
    }
}

#[allow(dead_code)]
pub fn request_with_mirrors(url: &str, mirrors: &[&str], dir: &Path) -> DownloadRequest {
    DownloadRequest {
        url: url.to_string(),
        mirrors: mirrors.iter().map(|s| s.to_string()).collect(),
        output_dir: dir.to_path_buf(),
        filename: None,
        headers: HashMap::new(),
    }
}

/// Receive events until the predicate matches, failing after `timeout`.
/// Returns every event seen up to and including the match.
pub async fn wait_for_event<F>(
    rx: &mut Receiver<DownloadEvent>,
    timeout: Duration,
    mut pred: F,
) -> Vec<DownloadEvent>
where
    F: FnMut(&DownloadEvent) -> bool,
{
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let ev = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for event; saw {:?}", seen))
            .expect("event channel closed");
        let done = pred(&ev);
        seen.push(ev);
        if done {
            return seen;
        }
    }
}

/// A deterministic test body: cycling byte pattern of `len` bytes.
pub fn pattern_body(len: usize) -> Vec<u8> {
    (0u8..251).cycle().take(len).collect()
}
