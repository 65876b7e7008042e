//! Advisory `flock` locks on files under the storage directory.
//!
//! Two locks exist per store. The owner lock is held by the one process
//! allowed to run recovery and the daemon loop; the write lock is held
//! briefly around every record read-compare-write so the version check
//! also holds between processes.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::errors::StoreError;

/// A held lock, released when dropped
pub(super) struct DirLock {
    path: PathBuf,
    #[cfg(unix)]
    _held: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _held: File,
}

impl DirLock {
    /// Wait until the lock is free, then take it
    pub(super) fn acquire(path: &Path) -> Result<Self, StoreError> {
        Self::take(path, true)?.ok_or_else(|| StoreError::Locked(path.to_path_buf()))
    }

    /// Take the lock only if nobody holds it
    pub(super) fn try_acquire(path: &Path) -> Result<Option<Self>, StoreError> {
        Self::take(path, false)
    }

    #[cfg(unix)]
    fn take(path: &Path, wait: bool) -> Result<Option<Self>, StoreError> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let arg = if wait {
            FlockArg::LockExclusive
        } else {
            FlockArg::LockExclusiveNonblock
        };
        match Flock::lock(open_lock_file(path)?, arg) {
            Ok(held) => Ok(Some(Self {
                path: path.to_path_buf(),
                _held: held,
            })),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(StoreError::Io(errno.into())),
        }
    }

    // No advisory locking here; a single process per storage directory is assumed.
    #[cfg(not(unix))]
    fn take(path: &Path, _wait: bool) -> Result<Option<Self>, StoreError> {
        Ok(Some(Self {
            path: path.to_path_buf(),
            _held: open_lock_file(path)?,
        }))
    }
}

impl fmt::Debug for DirLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirLock").field("path", &self.path).finish()
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}
