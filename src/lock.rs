//! Cross-process exclusion for commands that write the embedding store.
//!
//! `index` and `forget` hold an advisory flock() on `picsift.lock` in the
//! base directory for the whole command. Read-only commands never take it.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE_NAME: &str = "picsift.lock";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{} is held by another picsift process", .0.display())]
    Busy(PathBuf),

    #[error("failed to lock {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive writer lock on a base directory, released on drop.
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Take the lock without waiting.
    pub fn acquire(base_path: &Path) -> Result<Self, LockError> {
        let path = base_path.join(LOCK_FILE_NAME);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        match flock(&file, Op::TryExclusive) {
            Ok(()) => {
                log::debug!("Locked {}", path.display());
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(LockError::Busy(path)),
            Err(e) => Err(io_err(e)),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.file, Op::Unlock) {
            log::warn!("Failed to unlock {}: {e}", self.path.display());
        }
    }
}

enum Op {
    TryExclusive,
    Unlock,
}

#[cfg(unix)]
fn flock(file: &File, op: Op) -> io::Result<()> {
    let op = match op {
        Op::TryExclusive => libc::LOCK_EX | libc::LOCK_NB,
        Op::Unlock => libc::LOCK_UN,
    };
    // EWOULDBLOCK maps to ErrorKind::WouldBlock
    if unsafe { libc::flock(file.as_raw_fd(), op) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn flock(_file: &File, _op: Op) -> io::Result<()> {
    Ok(())
}
