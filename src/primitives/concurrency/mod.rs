#![allow(unsafe_code)]
//! Synchronization primitives: the fair reader/writer lock, the
//! transaction lock manager, and the cross-process store lock.

mod fair;
mod locks;

pub use fair::{FairReadGuard, FairRwLock, FairWriteGuard};
pub use locks::{LockManager, LockMode, LockTarget};

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::types::{Result, TesseraError};

/// Sticky per-store failure flag. Once tripped, every component sharing it
/// refuses further work until the store is reopened.
#[derive(Default)]
pub struct PanicState {
    tripped: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl PanicState {
    /// Fresh, untripped state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails with `Panicked` once tripped.
    pub fn check(&self) -> Result<()> {
        if !self.tripped.load(Ordering::Acquire) {
            return Ok(());
        }
        Err(TesseraError::Panicked(self.reason()))
    }

    /// Records the first fatal failure and returns the error to surface.
    pub fn trip(&self, reason: impl Into<String>) -> TesseraError {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            let reason = reason.into();
            error!(reason = %reason, "store.panicked");
            *slot = Some(reason);
            self.tripped.store(true, Ordering::Release);
        }
        TesseraError::Panicked(slot.clone().unwrap_or_default())
    }

    /// Whether the state has been tripped.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .clone()
            .unwrap_or_else(|| "store panicked".to_string())
    }
}

/// Name of the lock file inside a store directory.
pub const LOCK_FILE_NAME: &str = "LOCK";

/// Exclusive ownership of a store directory by this handle.
///
/// The lock is tied to the open file description, so a second handle in the
/// same process conflicts just like another process would. Dropping the
/// guard (or the process dying) releases it.
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Takes the lock on `dir/LOCK` without blocking.
    pub fn acquire(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if !sys::try_lock_exclusive(&file)? {
            return Err(TesseraError::bad_argument(format!(
                "store {} is open in another process",
                dir.as_ref().display()
            )));
        }
        debug!(path = %path.display(), "store_lock.acquired");
        Ok(Self { file, path })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = sys::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %err, "store_lock.unlock_failed");
        }
    }
}

#[cfg(unix)]
mod sys {
    use super::*;
    use std::os::unix::io::AsRawFd;

    pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        loop {
            let res = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(code) if code == libc::EWOULDBLOCK => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::*;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
        unsafe {
            let mut overlapped: OVERLAPPED = zeroed();
            let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;
            let res = LockFileEx(file.as_raw_handle() as isize, flags, 0, 1, 0, &mut overlapped);
            if res != 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(code) if code == ERROR_LOCK_VIOLATION as i32) {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        unsafe {
            let mut overlapped: OVERLAPPED = zeroed();
            let res = UnlockFileEx(file.as_raw_handle() as isize, 0, 1, 0, &mut overlapped);
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}
