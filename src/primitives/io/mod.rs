#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use crate::types::{Result, TesseraError};

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes file data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// Opens backing files. The store opens every data and log file through one
/// provider so tests can substitute failing devices.
pub trait IoProvider: Send + Sync + 'static {
    /// Opens (creating when `create` is set) the file at `path`.
    fn open(&self, path: &Path, create: bool, readonly: bool) -> Result<Arc<dyn FileIo>>;
}

/// Provider backed by the host file system.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdIoProvider;

impl IoProvider for StdIoProvider {
    fn open(&self, path: &Path, create: bool, readonly: bool) -> Result<Arc<dyn FileIo>> {
        let io = if readonly {
            StdFileIo::open_readonly(path)?
        } else if create {
            StdFileIo::open(path)?
        } else {
            StdFileIo::open_existing(path)?
        };
        Ok(Arc::new(io))
    }
}

#[cfg(unix)]
mod positioned {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod positioned {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Standard file I/O implementation using `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    /// Opens an existing file for read-write access.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::new(file))
    }

    /// Opens an existing file for reading only.
    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        positioned::read_exact(&self.inner, off, dst).map_err(TesseraError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        positioned::write_all(&self.inner, off, src).map_err(TesseraError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(TesseraError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(TesseraError::from)
    }
}

/// Shared switchboard for [`FaultyIo`] files: counts syncs and fails writes or
/// syncs on demand.
#[derive(Default)]
pub struct FaultInjector {
    fail_writes: AtomicBool,
    fail_syncs: AtomicBool,
    syncs: AtomicU64,
    writes: AtomicU64,
}

impl FaultInjector {
    /// New injector with every fault disarmed.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every subsequent write fail.
    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    /// Makes every subsequent sync fail.
    pub fn fail_syncs(&self, on: bool) {
        self.fail_syncs.store(on, Ordering::SeqCst);
    }

    /// Successful syncs observed so far.
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Successful writes observed so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn injected(what: &str) -> TesseraError {
        TesseraError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("injected {what} failure"),
        ))
    }
}

/// File wrapper that consults a [`FaultInjector`] before touching the device.
pub struct FaultyIo {
    inner: Arc<dyn FileIo>,
    faults: Arc<FaultInjector>,
}

impl FaultyIo {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn FileIo>, faults: Arc<FaultInjector>) -> Self {
        Self { inner, faults }
    }
}

impl FileIo for FaultyIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if self.faults.fail_writes.load(Ordering::SeqCst) {
            return Err(FaultInjector::injected("write"));
        }
        self.inner.write_at(off, src)?;
        self.faults.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        if self.faults.fail_syncs.load(Ordering::SeqCst) {
            return Err(FaultInjector::injected("sync"));
        }
        self.inner.sync_all()?;
        self.faults.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.truncate(len)
    }
}

/// Provider whose files all share one [`FaultInjector`].
#[derive(Clone)]
pub struct FaultyIoProvider {
    faults: Arc<FaultInjector>,
}

impl FaultyIoProvider {
    /// Provider reporting to `faults`.
    pub fn new(faults: Arc<FaultInjector>) -> Self {
        Self { faults }
    }
}

impl IoProvider for FaultyIoProvider {
    fn open(&self, path: &Path, create: bool, readonly: bool) -> Result<Arc<dyn FileIo>> {
        let inner = StdIoProvider.open(path, create, readonly)?;
        Ok(Arc::new(FaultyIo::new(inner, Arc::clone(&self.faults))))
    }
}
