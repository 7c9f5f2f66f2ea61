//! Advisory file locks guarding the single-writer parts of an index.
//!
//! Uses flock() on a named file inside the storage directory.
//! - `scan.lock`: held for the duration of one scan
//! - `embed.lock`: held by the thread driving an embedding run
//!
//! flock locks belong to the open file description, so two acquisitions from
//! the same process conflict just like acquisitions from two processes.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

pub const SCAN_LOCK: &str = "scan.lock";
pub const EMBED_LOCK: &str = "embed.lock";

/// A held file lock that releases on drop
pub struct FileLock {
    #[allow(dead_code)]
    file: File,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileLock")
    }
}

impl FileLock {
    /// Attempt to acquire the named lock in `dir` without blocking.
    /// Fails with `WouldBlock` when someone else holds it.
    pub fn try_acquire(dir: &Path, name: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(name))?;

        Self::try_lock_exclusive(&file, name)?;

        Ok(FileLock { file })
    }

    /// True when the named lock could be taken right now.
    pub fn is_free(dir: &Path, name: &str) -> bool {
        Self::try_acquire(dir, name).is_ok()
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File, name: &str) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    format!("{name} is held by another run"),
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File, _name: &str) -> io::Result<()> {
        // On non-Unix platforms only the in-process run registry guards runs
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for FileLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // Release the lock - ignore errors on drop
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}
