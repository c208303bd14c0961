//! Advisory file locking for the vector index files.
//!
//! Uses flock() on a lock file next to the index.
//! - Writers (`add`, `rebuild`): exclusive lock around load-mutate-persist
//! - Readers (`search`): shared lock so they never see a half-written pair
//!
//! flock locks belong to the open file description, so two handles opened
//! by the same process exclude each other just like separate processes do.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Lock file name placed in the base directory
pub const LOCK_FILE_NAME: &str = "index.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A held file lock that releases on drop
pub struct IndexLock {
    #[allow(dead_code)]
    file: File,
    mode: LockMode,
}

impl IndexLock {
    /// Acquire a lock, blocking until available.
    pub fn acquire(base_path: &Path, mode: LockMode) -> io::Result<Self> {
        let file = Self::open(base_path)?;
        Self::lock(&file, mode, false)?;
        Ok(IndexLock { file, mode })
    }

    /// Attempt to acquire a lock without blocking.
    /// Returns `WouldBlock` if a conflicting lock is held.
    pub fn try_acquire(base_path: &Path, mode: LockMode) -> io::Result<Self> {
        let file = Self::open(base_path)?;
        Self::lock(&file, mode, true)?;
        Ok(IndexLock { file, mode })
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    fn open(base_path: &Path) -> io::Result<File> {
        std::fs::create_dir_all(base_path)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(base_path.join(LOCK_FILE_NAME))
    }

    #[cfg(unix)]
    fn lock(file: &File, mode: LockMode, non_blocking: bool) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut op = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };
        if non_blocking {
            op |= libc::LOCK_NB;
        }

        let result = unsafe { libc::flock(fd, op) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "Vector index is locked by another writer",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock(_file: &File, _mode: LockMode, _non_blocking: bool) -> io::Result<()> {
        // No cross-process protection here; the in-process RwLock still
        // serializes writers within one process.
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for IndexLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // Release the lock - ignore errors on drop
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}
