//! Advisory lock on a docvault data directory.
//!
//! Only one process may drive a data directory at a time. The lock is an
//! `fs2` exclusive lock on `<data_dir>/docvault.lock`, released when the
//! [`WorkspaceLock`] is dropped.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::{Error, Result};

/// Lock file name inside the data directory.
pub const LOCK_FILE_NAME: &str = "docvault.lock";

/// A held data-directory lock.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Try to lock `data_dir` without blocking.
    ///
    /// Returns [`Error::WorkspaceLocked`] when another handle holds it.
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(Error::WorkspaceLocked(data_dir.to_path_buf()));
            }
            Err(e) => return Err(Error::Io(e)),
        }

        // Owner pid is informational only; the flock is the real guard.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        debug!(path = %path.display(), "Acquired workspace lock");
        Ok(Self { file, path })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "Failed to release workspace lock");
        }
    }
}
