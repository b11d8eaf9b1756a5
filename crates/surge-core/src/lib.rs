//! Surge core: a resumable, multi-connection HTTP download engine.
//!
//! The pool ([`pool::DownloadPool`]) accepts download requests, resolves
//! resume state from the persistent store, probes the origin, picks the
//! concurrent or single-stream engine, and publishes typed events. External
//! shells (CLI, daemon, UI) consume the pool API and the event stream.

pub mod config;
pub mod logging;

pub mod downloader;
pub mod events;
pub mod pool;
pub mod probe;
pub mod progress;
pub mod storage;
pub mod store;
pub mod task;
pub mod url_model;
