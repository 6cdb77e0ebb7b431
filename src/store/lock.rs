//! Advisory per-record file locks.
//!
//! Every record `<id>.json` has a companion `<id>.lock`. Writers hold an
//! exclusive `flock` on it for the duration of a read-modify-write. All
//! processes sharing a workspace cooperate through the same lock files.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::errors::StoreError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// An exclusive lock on one record. Released on drop.
#[derive(Debug)]
pub struct RecordLock {
    file: File,
    path: PathBuf,
}

impl RecordLock {
    /// Acquire the lock at `path`, waiting at most `timeout`.
    pub fn acquire(path: &Path, id: &str, timeout: Duration) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;

        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    if start.elapsed() > MAX_BACKOFF {
                        debug!(id, waited_ms = start.elapsed().as_millis() as u64, "lock acquired after contention");
                    }
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    let waited = start.elapsed();
                    if waited >= timeout {
                        warn!(id, waited_ms = waited.as_millis() as u64, "lock acquisition timed out");
                        return Err(StoreError::LockTimeout {
                            id: id.to_string(),
                            waited,
                        });
                    }
                    std::thread::sleep(backoff.min(timeout.saturating_sub(waited)));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release record lock");
        }
    }
}
