//! Working-file I/O and finalization.
//!
//! A download writes into `<dest>.surge`, pre-allocated to the full size so
//! positional writes land anywhere (fallocate on Linux when available, else
//! set_len). Finalize fsyncs and renames onto `<dest>`, falling back to
//! copy+unlink when the rename crosses filesystems.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Suffix of the partial working file.
pub const WORKING_SUFFIX: &str = ".surge";

/// Path of the working file for `dest` (`file.iso` → `file.iso.surge`).
pub fn working_path(dest: &Path) -> PathBuf {
    let mut o = dest.as_os_str().to_owned();
    o.push(WORKING_SUFFIX);
    PathBuf::from(o)
}

/// Writer for a working file. Cloneable and safe for concurrent positional
/// writes; each `write_at` is independent (pwrite-style).
#[derive(Clone)]
pub struct WorkingFile {
    file: Arc<File>,
    path: PathBuf,
}

impl WorkingFile {
    /// Create (truncating) the working file for `dest` and pre-allocate
    /// `size` bytes.
    pub fn create(dest: &Path, size: u64) -> Result<Self> {
        let path = working_path(dest);
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to create working file: {}", path.display()))?;
        let wf = WorkingFile {
            file: Arc::new(file),
            path,
        };
        wf.preallocate(size)?;
        Ok(wf)
    }

    /// Open the existing working file for `dest` (resume; no truncation).
    pub fn open_existing(dest: &Path) -> Result<Self> {
        let path = working_path(dest);
        let file = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open working file: {}", path.display()))?;
        Ok(WorkingFile {
            file: Arc::new(file),
            path,
        })
    }

    /// Reserve `size` bytes. On Unix tries `posix_fallocate` for real block
    /// allocation; falls back to `set_len` on failure or non-Unix.
    fn preallocate(&self, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        #[cfg(unix)]
        {
            let fd = self.file.as_raw_fd();
            let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
            if r == 0 {
                return Ok(());
            }
            tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
        }
        self.file
            .set_len(size)
            .context("failed to preallocate working file")?;
        Ok(())
    }

    /// Write `data` at `offset` without moving any shared cursor.
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let n = self
            .file
            .write_at(data, offset)
            .context("working file write_at failed")?;
        if n != data.len() {
            anyhow::bail!("short write: {} of {}", n, data.len());
        }
        Ok(())
    }

    /// Non-Unix fallback: seek + write on a cloned handle.
    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = (*self.file).try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)?;
        Ok(())
    }

    /// Flush file data and metadata to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().context("working file sync failed")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the working file onto `dest`. Tries an atomic rename first; when
    /// that fails (e.g. dest on another filesystem) copies and unlinks.
    /// Consumes the writer; call `sync` first for durability.
    pub fn finalize(self, dest: &Path) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);

        match std::fs::rename(&path, dest) {
            Ok(()) => Ok(()),
            Err(rename_err) => {
                tracing::debug!(
                    "rename {} -> {} failed ({}), copying instead",
                    path.display(),
                    dest.display(),
                    rename_err
                );
                std::fs::copy(&path, dest).with_context(|| {
                    format!("failed to copy {} to {}", path.display(), dest.display())
                })?;
                std::fs::remove_file(&path).with_context(|| {
                    format!("failed to remove working file {}", path.display())
                })?;
                Ok(())
            }
        }
    }

    /// Delete the working file (cancelled or discarded download).
    pub fn discard(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

/// Remove the working file for `dest` if one exists (cancel of a cold
/// download that has no open handle).
pub fn remove_working_file(dest: &Path) -> Result<()> {
    let path = working_path(dest);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}
