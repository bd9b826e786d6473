//! Process-shared accept mutex
//!
//! A robust, process-shared `pthread_mutex_t` placed in a `MAP_SHARED`
//! mapping. Fork-mode workers inherit an anonymous mapping; exec-mode
//! workers map the same backing file by path.
//!
//! If a holder dies (crash, SIGKILL, OOM kill) the kernel marks the mutex
//! owner-dead and the next locker takes it over. The serve loop only holds
//! it across poll+accept, never while serving a connection.

use std::fs::OpenOptions;
use std::io;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::error::MutexError;

/// Cross-process mutex. Created once by the supervisor before any worker.
#[derive(Debug)]
pub struct ProcessMutex {
    raw: NonNull<libc::pthread_mutex_t>,
    /// Creating process; the only one allowed to destroy the mutex.
    creator: Option<u32>,
    backing: Option<PathBuf>,
}

// The mutex is process-shared and lives in shared memory.
unsafe impl Send for ProcessMutex {}
unsafe impl Sync for ProcessMutex {}

const MUTEX_SIZE: usize = mem::size_of::<libc::pthread_mutex_t>();

impl ProcessMutex {
    /// Create in an anonymous shared mapping (inherited across `fork`).
    pub fn create_anonymous() -> Result<Self, MutexError> {
        let raw = map_shared(-1)?;
        let mutex = Self { raw, creator: Some(std::process::id()), backing: None };
        mutex.init()?;
        Ok(mutex)
    }

    /// Create in a file mapping that a re-executed worker can open.
    pub fn create_at(path: impl AsRef<Path>) -> Result<Self, MutexError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| MutexError::File { path: path.clone(), source })?;
        file.set_len(MUTEX_SIZE as u64)
            .map_err(|source| MutexError::File { path: path.clone(), source })?;

        let raw = map_shared(file.as_raw_fd())?;
        let mutex = Self { raw, creator: Some(std::process::id()), backing: Some(path) };
        mutex.init()?;
        Ok(mutex)
    }

    /// Attach to a mutex created by [`ProcessMutex::create_at`].
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self, MutexError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| MutexError::File { path: path.clone(), source })?;
        let len = file
            .metadata()
            .map_err(|source| MutexError::File { path: path.clone(), source })?
            .len();
        if len < MUTEX_SIZE as u64 {
            return Err(MutexError::File {
                path,
                source: io::Error::new(io::ErrorKind::InvalidData, "mutex file too short"),
            });
        }

        let raw = map_shared(file.as_raw_fd())?;
        Ok(Self { raw, creator: None, backing: Some(path) })
    }

    fn init(&self) -> Result<(), MutexError> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        unsafe {
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr())).map_err(MutexError::Init)?;
            let result = check(libc::pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            ))
            .and_then(|()| {
                check(libc::pthread_mutexattr_setrobust(
                    attr.as_mut_ptr(),
                    libc::PTHREAD_MUTEX_ROBUST,
                ))
            })
            .and_then(|()| check(libc::pthread_mutex_init(self.raw.as_ptr(), attr.as_ptr())));
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            result.map_err(MutexError::Init)
        }
    }

    /// Block until the mutex is ours.
    pub fn lock(&self) -> Result<ProcessMutexGuard<'_>, MutexError> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.as_ptr()) };
        self.acquired(rc).map_err(MutexError::Wait)
    }

    /// Take the mutex only if it is free.
    pub fn try_lock(&self) -> Result<Option<ProcessMutexGuard<'_>>, MutexError> {
        match unsafe { libc::pthread_mutex_trylock(self.raw.as_ptr()) } {
            libc::EBUSY => Ok(None),
            rc => self.acquired(rc).map(Some).map_err(MutexError::Wait),
        }
    }

    /// Turn a lock return code into a guard, taking over from a dead owner.
    fn acquired(&self, rc: libc::c_int) -> io::Result<ProcessMutexGuard<'_>> {
        match rc {
            0 => {}
            libc::EOWNERDEAD => {
                tracing::warn!("Accept mutex holder died; recovering");
                check(unsafe { libc::pthread_mutex_consistent(self.raw.as_ptr()) })?;
            }
            rc => return Err(io::Error::from_raw_os_error(rc)),
        }
        Ok(ProcessMutexGuard { mutex: self, _not_send: PhantomData })
    }

    /// Backing file, for handing to a re-executed worker.
    pub fn backing_path(&self) -> Option<&Path> {
        self.backing.as_deref()
    }

    fn unlock(&self) {
        unsafe {
            libc::pthread_mutex_unlock(self.raw.as_ptr());
        }
    }
}

impl Drop for ProcessMutex {
    fn drop(&mut self) {
        let is_creator = self.creator == Some(std::process::id());
        unsafe {
            if is_creator {
                libc::pthread_mutex_destroy(self.raw.as_ptr());
            }
            libc::munmap(self.raw.as_ptr() as *mut libc::c_void, MUTEX_SIZE);
        }
        if is_creator {
            if let Some(ref path) = self.backing {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

/// Releases the mutex on drop. Must stay on the locking thread.
#[derive(Debug)]
pub struct ProcessMutexGuard<'a> {
    mutex: &'a ProcessMutex,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ProcessMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// pthread calls return the error number instead of setting errno.
fn check(rc: libc::c_int) -> io::Result<()> {
    match rc {
        0 => Ok(()),
        rc => Err(io::Error::from_raw_os_error(rc)),
    }
}

fn map_shared(fd: libc::c_int) -> Result<NonNull<libc::pthread_mutex_t>, MutexError> {
    let flags = if fd < 0 {
        libc::MAP_SHARED | libc::MAP_ANONYMOUS
    } else {
        libc::MAP_SHARED
    };
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            MUTEX_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(MutexError::Map(io::Error::last_os_error()));
    }
    NonNull::new(base as *mut libc::pthread_mutex_t)
        .ok_or_else(|| MutexError::Map(io::Error::from_raw_os_error(libc::ENOMEM)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_lock_and_try_lock() {
        let m = ProcessMutex::create_anonymous().unwrap();
        let guard = m.lock().unwrap();
        assert!(m.try_lock().unwrap().is_none());
        drop(guard);
        assert!(m.try_lock().unwrap().is_some());
        // The guard from try_lock dropped at end of statement.
        assert!(m.try_lock().unwrap().is_some());
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let m = Arc::new(ProcessMutex::create_anonymous().unwrap());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let (m, inside, max_seen) = (m.clone(), inside.clone(), max_seen.clone());
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let _g = m.lock().unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_micros(50));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_file_backed_shares_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accept.mutex");

        let owner = ProcessMutex::create_at(&path).unwrap();
        let attached = ProcessMutex::open_at(&path).unwrap();
        assert_eq!(attached.backing_path(), Some(path.as_path()));

        let guard = owner.lock().unwrap();
        assert!(attached.try_lock().unwrap().is_none());
        drop(guard);
        assert!(attached.try_lock().unwrap().is_some());

        drop(attached);
        assert!(path.exists());
        drop(owner);
        assert!(!path.exists());
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessMutex::open_at(dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, MutexError::File { .. }));
    }
}
