//! On-demand status snapshots for external consumers.

use serde::Serialize;

use crate::downloader::DownloadConfig;
use crate::store::{DownloadEntry, DownloadStatusKind};
use crate::url_model;

/// Read-only view of one download, assembled from live state when the
/// download is in the pool and from the store otherwise.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadStatus {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub status: DownloadStatusKind,
    pub downloaded: u64,
    pub total_size: Option<u64>,
    /// Percent complete; 0 when the size is unknown.
    pub progress: f64,
    /// Megabytes per second over the last sample window.
    pub speed_mbps: f64,
    /// Estimated seconds remaining at the current speed.
    pub eta_secs: Option<u64>,
    pub connections: usize,
    pub error: Option<String>,
}

pub(super) fn live_status(config: &DownloadConfig) -> DownloadStatus {
    let progress = &config.progress;
    let downloaded = progress.downloaded();
    let total = progress.total_size();
    let speed = progress.speed();
    let status = if progress.is_done() {
        DownloadStatusKind::Completed
    } else if progress.is_paused() {
        DownloadStatusKind::Paused
    } else {
        DownloadStatusKind::Downloading
    };
    DownloadStatus {
        id: config.id.clone(),
        url: config.url.clone(),
        filename: config
            .filename_hint
            .clone()
            .unwrap_or_else(|| url_model::derive_filename(None, &config.url, None)),
        status,
        downloaded,
        total_size: (total > 0).then_some(total),
        progress: percent(downloaded, total),
        speed_mbps: speed as f64 / (1024.0 * 1024.0),
        eta_secs: eta(downloaded, total, speed),
        connections: progress.active_workers(),
        error: None,
    }
}

pub(super) fn queued_status(config: &DownloadConfig) -> DownloadStatus {
    DownloadStatus {
        id: config.id.clone(),
        url: config.url.clone(),
        filename: config
            .filename_hint
            .clone()
            .unwrap_or_else(|| url_model::derive_filename(None, &config.url, None)),
        status: DownloadStatusKind::Queued,
        downloaded: 0,
        total_size: None,
        progress: 0.0,
        speed_mbps: 0.0,
        eta_secs: None,
        connections: 0,
        error: None,
    }
}

pub(super) fn stored_status(entry: &DownloadEntry) -> DownloadStatus {
    DownloadStatus {
        id: entry.id.clone(),
        url: entry.url.clone(),
        filename: entry.filename.clone(),
        status: entry.status,
        downloaded: entry.downloaded,
        total_size: entry.total_size,
        progress: percent(entry.downloaded, entry.total_size.unwrap_or(0)),
        speed_mbps: 0.0,
        eta_secs: None,
        connections: 0,
        error: entry.error.clone(),
    }
}

fn percent(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (downloaded as f64 / total as f64) * 100.0
    }
}

fn eta(downloaded: u64, total: u64, speed: u64) -> Option<u64> {
    if total == 0 || speed == 0 || downloaded >= total {
        return None;
    }
    Some((total - downloaded) / speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_unknown_total() {
        assert_eq!(percent(100, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }

    #[test]
    fn eta_requires_speed_and_total() {
        assert_eq!(eta(0, 0, 100), None);
        assert_eq!(eta(50, 100, 0), None);
        assert_eq!(eta(50, 100, 25), Some(2));
        assert_eq!(eta(100, 100, 25), None);
    }
}
