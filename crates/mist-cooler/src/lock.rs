//! Single-instance guard: an advisory exclusive lock on a fixed file.

use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub(crate) enum LockError {
    #[error("another run holds {}", .0.display())]
    AlreadyRunning(PathBuf),
    #[error("cannot lock {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held for the whole run; the lock is released when this is dropped.
#[derive(Debug)]
pub(crate) struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl ProcessLock {
    /// Try to take the lock without blocking.
    pub(crate) fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        match file.try_lock() {
            Ok(()) => {
                info!(path = %path.display(), "lock acquired");
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(TryLockError::WouldBlock) => Err(LockError::AlreadyRunning(path.to_path_buf())),
            Err(TryLockError::Error(e)) => Err(io_err(e)),
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        match self.file.unlock() {
            Ok(()) => info!(path = %self.path.display(), "lock released"),
            Err(e) => warn!(path = %self.path.display(), "lock release failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mist.lock");
        let _lock = ProcessLock::acquire(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn second_acquire_reports_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mist.lock");

        let _held = ProcessLock::acquire(&path).unwrap();
        let err = ProcessLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning(p) if p == path));
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mist.lock");

        drop(ProcessLock::acquire(&path).unwrap());
        ProcessLock::acquire(&path).unwrap();
    }

    #[test]
    fn existing_file_content_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mist.lock");
        std::fs::write(&path, "stale pid").unwrap();

        let _lock = ProcessLock::acquire(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "stale pid");
    }

    #[test]
    fn unopenable_path_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("mist.lock");
        let err = ProcessLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Io { .. }));
    }
}
