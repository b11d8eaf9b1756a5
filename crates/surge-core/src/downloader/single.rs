//! Single-stream fallback for servers without byte-range support.
//!
//! One sequential GET into the working file. There is nothing to resume:
//! pause (or cancel) aborts the transfer and discards the partial file, and
//! a later resume starts over from byte zero.

use anyhow::Result;
use curl::easy::{Easy2, Handler, WriteError};
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::events::DownloadEvent;
use crate::probe::ProbeResult;
use crate::progress::ProgressState;
use crate::storage::WorkingFile;

use super::{client, release_claim, resolve_destination, ClaimedPaths, DownloadConfig, EngineOutcome};

pub(crate) fn run(
    cfg: &DownloadConfig,
    probed: &ProbeResult,
    cancel: &Arc<AtomicBool>,
    claimed: &ClaimedPaths,
) -> Result<EngineOutcome> {
    let (dest, filename) = resolve_destination(cfg, &probed.filename, claimed)?;
    let expected = probed.file_size;

    let file = match WorkingFile::create(&dest, expected.unwrap_or(0)) {
        Ok(f) => f,
        Err(e) => {
            release_claim(claimed, &dest);
            return Err(e);
        }
    };

    let progress = &cfg.progress;
    progress.set_total_size(expected.unwrap_or(0));
    progress.start_session();

    cfg.events.emit(DownloadEvent::Started {
        id: cfg.id.clone(),
        url: cfg.url.clone(),
        filename: filename.clone(),
        total_size: expected.unwrap_or(0),
        dest_path: dest.clone(),
        state: Some("new".to_string()),
    });
    progress.mark_started();

    let handler = StreamHandler {
        file: file.clone(),
        progress: Arc::clone(progress),
        cancel: Arc::clone(cancel),
        written: 0,
        status: None,
        abort: None,
    };
    let mut easy = Easy2::new(handler);
    client::configure(&mut easy, &cfg.url, &cfg.headers, &cfg.runtime, None)?;
    let performed = easy.perform();

    let (abort, written) = {
        let h = easy.get_ref();
        (h.abort.clone(), h.written)
    };

    match abort {
        Some(StreamAbort::Paused) => {
            file.discard()?;
            Ok(EngineOutcome::Paused {
                dest_path: Some(dest),
                state: None,
            })
        }
        Some(StreamAbort::Cancelled) => {
            file.discard()?;
            Ok(EngineOutcome::Cancelled {
                dest_path: Some(dest),
            })
        }
        Some(StreamAbort::BadStatus(code)) => {
            let _ = file.discard();
            Ok(EngineOutcome::Failed {
                error: format!("HTTP {}", code),
                dest_path: Some(dest),
                state: None,
            })
        }
        Some(StreamAbort::Io(msg)) => {
            let _ = file.discard();
            Ok(EngineOutcome::Failed {
                error: msg,
                dest_path: Some(dest),
                state: None,
            })
        }
        None => {
            if let Err(e) = performed {
                let _ = file.discard();
                return Ok(EngineOutcome::Failed {
                    error: e.to_string(),
                    dest_path: Some(dest),
                    state: None,
                });
            }
            let code = easy.response_code().unwrap_or(0);
            if !(200..300).contains(&code) {
                let _ = file.discard();
                return Ok(EngineOutcome::Failed {
                    error: format!("HTTP {}", code),
                    dest_path: Some(dest),
                    state: None,
                });
            }
            if let Some(expected) = expected {
                if written != expected {
                    let _ = file.discard();
                    return Ok(EngineOutcome::Failed {
                        error: format!("partial transfer: {} of {} bytes", written, expected),
                        dest_path: Some(dest),
                        state: None,
                    });
                }
            }
            progress.set_total_size(written);
            file.sync()?;
            file.finalize(&dest)?;
            progress.set_done();
            Ok(EngineOutcome::Complete {
                filename,
                dest_path: dest,
                total_size: written,
                elapsed_ms: progress.elapsed_ms(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamAbort {
    Cancelled,
    Paused,
    BadStatus(u32),
    Io(String),
}

struct StreamHandler {
    file: WorkingFile,
    progress: Arc<ProgressState>,
    cancel: Arc<AtomicBool>,
    written: u64,
    status: Option<u32>,
    abort: Option<StreamAbort>,
}

impl StreamHandler {
    fn check_flags(&self) -> Option<StreamAbort> {
        if self.cancel.load(Ordering::SeqCst) {
            return Some(StreamAbort::Cancelled);
        }
        if self.progress.is_paused() {
            return Some(StreamAbort::Paused);
        }
        None
    }
}

impl Handler for StreamHandler {
    fn header(&mut self, data: &[u8]) -> bool {
        if let Ok(s) = str::from_utf8(data) {
            let line = s.trim_end();
            if line.starts_with("HTTP/") {
                self.status = line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|c| c.parse::<u32>().ok());
            }
        }
        true
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if let Some(reason) = self.check_flags() {
            self.abort = Some(reason);
            return Ok(0);
        }
        match self.status {
            Some(code) if (200..300).contains(&code) => {}
            Some(code) => {
                self.abort = Some(StreamAbort::BadStatus(code));
                return Ok(0);
            }
            None => {}
        }

        if let Err(e) = self.file.write_at(self.written, data) {
            self.abort = Some(StreamAbort::Io(e.to_string()));
            return Ok(0);
        }
        self.written += data.len() as u64;
        self.progress.record_write(self.written - data.len() as u64, data.len() as u64);
        Ok(data.len())
    }

    fn progress(&mut self, _dltotal: f64, _dlnow: f64, _ultotal: f64, _ulnow: f64) -> bool {
        if self.abort.is_some() {
            return false;
        }
        if let Some(reason) = self.check_flags() {
            self.abort = Some(reason);
            return false;
        }
        true
    }
}
