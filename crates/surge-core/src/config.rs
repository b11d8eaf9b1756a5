//! Runtime configuration: per-download tuning knobs.
//!
//! Every field has a built-in default; zero or empty means "unset" and the
//! accessor returns the default. A `RuntimeConfig` is read-only for the
//! duration of a download run. The same record doubles as the on-disk
//! config file under `~/.config/surge/config.toml`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of connections (workers) per download.
pub const DEFAULT_CONNECTIONS: usize = 8;
/// Default minimum chunk size in bytes (512 KiB).
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 512 * 1024;
/// Default per-worker transfer buffer in bytes (512 KiB).
pub const DEFAULT_WORKER_BUFFER_SIZE: usize = 512 * 1024;
/// Default maximum attempts per task before the download fails.
pub const DEFAULT_MAX_TASK_RETRIES: u32 = 5;
/// Default slow-worker threshold as a fraction of the mean worker speed.
pub const DEFAULT_SLOW_WORKER_THRESHOLD: f64 = 0.5;
/// Default grace period before a worker is eligible for slow-restart.
pub const DEFAULT_SLOW_WORKER_GRACE_MS: u64 = 10_000;
/// Default stall timeout: a worker with no bytes for this long is restarted.
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 30_000;
/// Default smoothing factor for the per-worker speed EMA.
pub const DEFAULT_SPEED_EMA_ALPHA: f64 = 0.3;
/// Default health monitor tick.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 1_000;
/// Default User-Agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = "surge/0.1";
/// Default cap on simultaneously running downloads in the pool.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;

/// Per-download tuning knobs. Zero/empty fields fall back to defaults via
/// the accessor methods; use those rather than reading fields directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum concurrent connections (workers) per download.
    pub connections: usize,
    /// Minimum chunk size in bytes; tasks are never split below this.
    pub min_chunk_size: u64,
    /// Per-worker transfer buffer size in bytes.
    pub worker_buffer_size: usize,
    /// Maximum attempts per task before the whole download errors.
    pub max_task_retries: u32,
    /// Fraction of the mean worker speed below which a worker is "slow".
    pub slow_worker_threshold: f64,
    /// Grace period (ms) before slow-worker restarts kick in.
    pub slow_worker_grace_ms: u64,
    /// A worker producing no bytes for this long (ms) is restarted.
    pub stall_timeout_ms: u64,
    /// Smoothing factor for per-worker speed EMAs, in (0, 1].
    pub speed_ema_alpha: f64,
    /// Health monitor tick interval (ms).
    pub health_check_interval_ms: u64,
    /// User-Agent header; applied unless the caller forwards its own.
    pub user_agent: String,
    /// Proxy URL: `http://`, `https://`, or `socks5://`. Empty = direct.
    pub proxy_url: String,
    /// Disable TLS certificate verification.
    pub skip_tls_verification: bool,
    /// Mirror the URL's directory structure under the output directory.
    pub preserve_url_path: bool,
    /// Force the sequential single-connection engine.
    pub sequential_download: bool,
    /// Maximum downloads running at once; excess is queued FIFO.
    pub max_concurrent_downloads: usize,
}

impl RuntimeConfig {
    pub fn connections(&self) -> usize {
        if self.connections > 0 {
            self.connections
        } else {
            DEFAULT_CONNECTIONS
        }
    }

    pub fn min_chunk_size(&self) -> u64 {
        if self.min_chunk_size > 0 {
            self.min_chunk_size
        } else {
            DEFAULT_MIN_CHUNK_SIZE
        }
    }

    pub fn worker_buffer_size(&self) -> usize {
        if self.worker_buffer_size > 0 {
            self.worker_buffer_size
        } else {
            DEFAULT_WORKER_BUFFER_SIZE
        }
    }

    pub fn max_task_retries(&self) -> u32 {
        if self.max_task_retries > 0 {
            self.max_task_retries
        } else {
            DEFAULT_MAX_TASK_RETRIES
        }
    }

    pub fn slow_worker_threshold(&self) -> f64 {
        if self.slow_worker_threshold > 0.0 {
            self.slow_worker_threshold
        } else {
            DEFAULT_SLOW_WORKER_THRESHOLD
        }
    }

    pub fn slow_worker_grace(&self) -> Duration {
        let ms = if self.slow_worker_grace_ms > 0 {
            self.slow_worker_grace_ms
        } else {
            DEFAULT_SLOW_WORKER_GRACE_MS
        };
        Duration::from_millis(ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        let ms = if self.stall_timeout_ms > 0 {
            self.stall_timeout_ms
        } else {
            DEFAULT_STALL_TIMEOUT_MS
        };
        Duration::from_millis(ms)
    }

    pub fn speed_ema_alpha(&self) -> f64 {
        if self.speed_ema_alpha > 0.0 && self.speed_ema_alpha <= 1.0 {
            self.speed_ema_alpha
        } else {
            DEFAULT_SPEED_EMA_ALPHA
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        let ms = if self.health_check_interval_ms > 0 {
            self.health_check_interval_ms
        } else {
            DEFAULT_HEALTH_CHECK_INTERVAL_MS
        };
        Duration::from_millis(ms)
    }

    pub fn user_agent(&self) -> &str {
        if self.user_agent.is_empty() {
            DEFAULT_USER_AGENT
        } else {
            &self.user_agent
        }
    }

    /// Proxy URL, or `None` when downloads go direct.
    pub fn proxy_url(&self) -> Option<&str> {
        if self.proxy_url.is_empty() {
            None
        } else {
            Some(&self.proxy_url)
        }
    }

    pub fn max_concurrent_downloads(&self) -> usize {
        if self.max_concurrent_downloads > 0 {
            self.max_concurrent_downloads
        } else {
            DEFAULT_MAX_CONCURRENT_DOWNLOADS
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("surge")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<RuntimeConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = RuntimeConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: RuntimeConfig = toml::from_str(&data)?;
    Ok(cfg)
}
