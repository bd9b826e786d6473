//! Single-instance lock file
//!
//! The supervisor opens the lock file for writing, takes an exclusive
//! `flock` on it and keeps it for its whole lifetime. The lock is released
//! when the guard drops in the acquiring process, or by the kernel when
//! every descriptor of the open file is closed.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::LockError;

/// Permission bits of a freshly created lock file.
pub const LOCK_FILE_MODE: u32 = 0o644;

/// Held single-instance lock.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
    /// Only this process may release the lock. Forked workers carry a copy.
    owner: u32,
}

impl LockGuard {
    /// Create or truncate `path`, lock it, and record our pid in it.
    ///
    /// Re-acquiring a stale path left by a previous run succeeds. A path
    /// locked by a live supervisor fails with [`LockError::AlreadyLocked`]
    /// without touching its contents.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(LOCK_FILE_MODE)
            .open(&path)
            .map_err(|source| LockError::Open { path: path.clone(), source })?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) => LockError::AlreadyLocked { path },
                _ => LockError::Open { path, source: err },
            });
        }

        let owner = std::process::id();
        let mut guard = Self { file, path, owner };
        guard
            .write_pid()
            .map_err(|source| LockError::Write { path: guard.path.clone(), source })?;

        tracing::debug!(path = %guard.path.display(), pid = owner, "Lock acquired");
        Ok(guard)
    }

    fn write_pid(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        writeln!(self.file, "{}", self.owner)?;
        self.file.sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid of the process holding the lock.
    pub fn owner(&self) -> u32 {
        self.owner
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if std::process::id() != self.owner {
            return;
        }
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!(path = %self.path.display(), "Lock released");
    }
}
