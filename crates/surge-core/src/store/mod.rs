//! Persistent download store: crash-safe index and resume state.
//!
//! Two logical tables back the store: `downloads` (one index row per
//! download id) and `states` (the resumable remainder of a download, keyed
//! by URL hash + destination path). SQLite serialises mutations per key, so
//! readers never observe half-written records.

mod db;

pub use db::StateStore;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::task::Task;

/// Download identifier: a short hex token, unique per admission.
pub type DownloadId = String;

/// Typed store errors callers need to distinguish from plumbing failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("ambiguous id prefix: {0}")]
    AmbiguousPrefix(String),
}

/// Index entry status; stored as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatusKind {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
}

impl DownloadStatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatusKind::Queued => "queued",
            DownloadStatusKind::Downloading => "downloading",
            DownloadStatusKind::Paused => "paused",
            DownloadStatusKind::Completed => "completed",
            DownloadStatusKind::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => DownloadStatusKind::Queued,
            "downloading" => DownloadStatusKind::Downloading,
            "paused" => DownloadStatusKind::Paused,
            "completed" => DownloadStatusKind::Completed,
            _ => DownloadStatusKind::Error,
        }
    }
}

/// Durable index record: exactly one per download id.
#[derive(Debug, Clone)]
pub struct DownloadEntry {
    pub id: DownloadId,
    pub url: String,
    pub url_hash: String,
    pub dest_path: String,
    pub filename: String,
    pub status: DownloadStatusKind,
    pub total_size: Option<u64>,
    pub downloaded: u64,
    /// Unix seconds; set when the download finishes.
    pub completed_at: Option<i64>,
    pub time_taken_ms: Option<u64>,
    pub mirrors: Vec<String>,
    pub error: Option<String>,
}

/// Crash-safe resumable snapshot of one download, keyed by
/// `(url_hash, dest_path)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDownloadState {
    pub id: DownloadId,
    pub url: String,
    pub url_hash: String,
    pub dest_path: String,
    pub filename: String,
    pub total_size: u64,
    pub downloaded: u64,
    /// Byte ranges still to fetch.
    pub tasks: Vec<Task>,
    /// Two-bit chunk bitmap at pause time.
    pub bitmap: Vec<u8>,
    pub chunk_size: u64,
    pub mirrors: Vec<String>,
    pub created_at: i64,
    pub paused_at: Option<i64>,
    /// Elapsed accumulated across sessions, in milliseconds.
    pub elapsed_ms: u64,
}

/// Hex SHA-256 of a download URL; the stable half of the state key.
pub fn url_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// Mint a fresh download id: a 12-hex-char digest over the URL, destination,
/// and the current clock, so retries of the same URL stay distinguishable.
pub fn new_download_id(url: &str, dest: &str) -> DownloadId {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(dest.as_bytes());
    hasher.update(nanos.to_le_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_hash_stable_and_distinct() {
        let a = url_hash("https://example.com/a");
        assert_eq!(a, url_hash("https://example.com/a"));
        assert_ne!(a, url_hash("https://example.com/b"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn download_ids_are_short_and_unique() {
        let a = new_download_id("https://x/f", "/tmp/f");
        let b = new_download_id("https://x/f", "/tmp/f");
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn status_kind_string_roundtrip() {
        for kind in [
            DownloadStatusKind::Queued,
            DownloadStatusKind::Downloading,
            DownloadStatusKind::Paused,
            DownloadStatusKind::Completed,
            DownloadStatusKind::Error,
        ] {
            assert_eq!(DownloadStatusKind::parse(kind.as_str()), kind);
        }
        assert_eq!(
            DownloadStatusKind::parse("garbage"),
            DownloadStatusKind::Error
        );
    }

    #[test]
    fn persisted_state_json_roundtrip() {
        let state = PersistedDownloadState {
            id: "abc123def456".to_string(),
            url: "https://example.com/f.iso".to_string(),
            url_hash: url_hash("https://example.com/f.iso"),
            dest_path: "/tmp/f.iso".to_string(),
            filename: "f.iso".to_string(),
            total_size: 1_048_576,
            downloaded: 262_144,
            tasks: vec![Task::new(262_144, 786_432)],
            bitmap: vec![0b1010, 0],
            chunk_size: 262_144,
            mirrors: vec!["https://mirror.example.com/f.iso".to_string()],
            created_at: 1_700_000_000,
            paused_at: Some(1_700_000_060),
            elapsed_ms: 60_000,
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: PersistedDownloadState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
