//! Typed download event bus.
//!
//! Many producers (pool drivers, engine threads) feed one consumer over a
//! bounded `tokio::sync::mpsc` channel. `Progress` events are best-effort:
//! on a full buffer they are dropped via `try_send`. Lifecycle events
//! (`Started`, `Paused`, `Complete`, `Error`, ...) are always delivered.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Default event channel capacity.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Error payload that survives JSON round-trips regardless of shape.
///
/// Serializes as a plain string. Deserializes from `null` (empty string),
/// a string, or any other JSON value (its compact text form), so foreign
/// producers can't break the event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorValue(pub String);

impl ErrorValue {
    pub fn new(msg: impl Into<String>) -> Self {
        ErrorValue(msg.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ErrorValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ErrorValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let s = match value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(ErrorValue(s))
    }
}

/// Events published by the pool and the download engines.
///
/// The tag doubles as the SSE event name for the control shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum DownloadEvent {
    Started {
        id: String,
        url: String,
        filename: String,
        total_size: u64,
        dest_path: PathBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<String>,
    },
    Progress {
        id: String,
        downloaded: u64,
        total_size: u64,
        /// Bytes per second over the last sample window.
        speed: f64,
        /// Elapsed wall time including previous sessions, in milliseconds.
        elapsed_ms: u64,
        connections: usize,
        /// Two-bit-per-chunk state bitmap.
        bitmap: Vec<u8>,
        chunk_size: u64,
        /// Bytes downloaded inside each partially-complete chunk.
        chunk_progress: HashMap<u32, u64>,
    },
    Paused {
        id: String,
        filename: String,
        downloaded: u64,
    },
    Resumed {
        id: String,
        filename: String,
    },
    Complete {
        id: String,
        filename: String,
        elapsed_ms: u64,
        total_size: u64,
    },
    Error {
        id: String,
        filename: String,
        #[serde(rename = "Err")]
        err: ErrorValue,
    },
    Queued {
        id: String,
        filename: String,
    },
    Removed {
        id: String,
        filename: String,
    },
    Request {
        id: String,
        url: String,
        filename: String,
        path: PathBuf,
        mirrors: Vec<String>,
        headers: HashMap<String, String>,
    },
}

impl DownloadEvent {
    /// True for the one event class that may be dropped under backpressure.
    pub fn is_droppable(&self) -> bool {
        matches!(self, DownloadEvent::Progress { .. })
    }
}

/// Producer handle for the event bus. Cheap to clone; one per download plus
/// one held by the pool.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<DownloadEvent>,
}

/// Create the event channel. The single receiver belongs to the UI / control
/// shell; the sender fans out to every download.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<DownloadEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, rx)
}

impl EventSender {
    /// Send from a blocking (non-async) thread. `Progress` is dropped when
    /// the buffer is full; anything else waits for space. Errors only when
    /// the receiver is gone, which is not the producer's problem.
    pub fn emit(&self, event: DownloadEvent) {
        if event.is_droppable() {
            let _ = self.tx.try_send(event);
        } else if self.tx.blocking_send(event).is_err() {
            tracing::debug!("event bus closed; lifecycle event discarded");
        }
    }

    /// Send from async context with the same drop policy as [`emit`].
    ///
    /// [`emit`]: EventSender::emit
    pub async fn emit_async(&self, event: DownloadEvent) {
        if event.is_droppable() {
            let _ = self.tx.try_send(event);
        } else if self.tx.send(event).await.is_err() {
            tracing::debug!("event bus closed; lifecycle event discarded");
        }
    }
}
