use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::ops::{Deref, Range};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::frame::Frame;
use super::meta::{
    self, Meta, CATALOG_PAGE, FIRST_DATA_PAGE, SUPERBLOCK_PAGE, SUPERBLOCK_PROBE_LEN,
};
use crate::primitives::bytes::le;
use crate::primitives::concurrency::{FairReadGuard, FairWriteGuard, PanicState};
use crate::primitives::io::{FileIo, IoProvider};
use crate::primitives::wal::Wal;
use crate::types::checksum::page_checksum;
use crate::types::{
    page::{self, PageHeader, PageKind, FLAG_COMPRESSED, PAGE_HDR_LEN},
    Lsn, PageId, Result, TableId, TesseraError,
};

/// Configuration for one table file.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Page size used when the file is created; an existing file keeps its own.
    pub page_size: u32,
    /// Approximate budget for cached page images.
    pub cache_bytes: usize,
    /// Store page bodies snappy-compressed when that saves space.
    pub compress: bool,
    /// Refuse write pins and never write the file.
    pub readonly: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: 8192,
            cache_bytes: 8 << 20,
            compress: false,
            readonly: false,
        }
    }
}

/// Pin strength.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PinMode {
    /// Any number of readers may pin a page.
    Read,
    /// At most one write pin per page.
    Write,
}

/// Enforces the write-ahead rule before a page image reaches the file.
pub trait WalGate: Send + Sync {
    /// Returns once the log is durable past `lsn`.
    fn fsync_through(&self, lsn: Lsn) -> Result<()>;
}

impl WalGate for Wal {
    fn fsync_through(&self, lsn: Lsn) -> Result<()> {
        Wal::fsync_through(self, lsn)
    }
}

/// Gate for files that are never paired with a log.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoWal;

impl WalGate for NoWal {
    fn fsync_through(&self, _lsn: Lsn) -> Result<()> {
        Ok(())
    }
}

/// Counters reported by [`PageStore::stats`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct PagerStats {
    /// Pins served from the cache.
    pub hits: u64,
    /// Pins that read the file.
    pub misses: u64,
    /// Clean frames dropped from the cache.
    pub evictions: u64,
    /// Page images written back.
    pub writebacks: u64,
    /// Frames currently cached.
    pub cached_pages: usize,
    /// Frames waiting for write-back.
    pub dirty_pages: usize,
    /// First page number never handed out.
    pub next_page: u64,
}

struct Inner {
    cache: LruCache<PageId, Arc<Frame>>,
    /// Min-heap of dirty pages keyed by rec-LSN, the first LSN that dirtied
    /// the page since its last write-back.
    dirty: BinaryHeap<Reverse<(Lsn, PageId)>>,
    next_page: PageId,
    superblock_dirty: bool,
    closed: bool,
    stats: PagerStats,
}

struct Shared {
    path: PathBuf,
    table: TableId,
    io: Arc<dyn FileIo>,
    page_size: usize,
    cache_pages: usize,
    options: PagerOptions,
    gate: Arc<dyn WalGate>,
    panic: Arc<PanicState>,
    meta: Mutex<Meta>,
    inner: Mutex<Inner>,
    flush_lock: Mutex<()>,
    release_gate: Mutex<()>,
    released: Condvar,
}

/// Fixed-size pages of one table file with a pin/dirty/flush discipline.
#[derive(Clone)]
pub struct PageStore {
    shared: Arc<Shared>,
}

impl PageStore {
    /// Opens `path`, creating it for `table`/`name` when it does not exist.
    pub fn open(
        path: impl AsRef<Path>,
        table: TableId,
        name: &str,
        provider: &dyn IoProvider,
        options: PagerOptions,
        gate: Arc<dyn WalGate>,
        panic: Arc<PanicState>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();
        if !exists && options.readonly {
            return Err(TesseraError::ReadOnly("cannot create a table file read-only"));
        }
        let io = provider.open(&path, !exists, options.readonly)?;
        let meta = if exists && io.len()? > 0 {
            load_meta(io.as_ref())?
        } else {
            let meta = Meta::fresh(options.page_size, table, name)?;
            let mut sb = vec![0u8; meta.page_size as usize];
            meta::write_superblock(&mut sb, &meta)?;
            let mut cat = vec![0u8; meta.page_size as usize];
            meta::write_catalog(&mut cat, &meta)?;
            write_image(io.as_ref(), CATALOG_PAGE, cat, false)?;
            write_image(io.as_ref(), SUPERBLOCK_PAGE, sb, false)?;
            io.sync_all()?;
            info!(path = %path.display(), table = table.0, name, page_size = meta.page_size, "pager.create");
            meta
        };
        if meta.table != table {
            return Err(TesseraError::corrupt(format!(
                "{} holds table {} but {} was expected",
                path.display(),
                meta.table,
                table
            )));
        }
        let page_size = meta.page_size as usize;
        let cache_pages = (options.cache_bytes / page_size).max(8);
        debug!(path = %path.display(), next_page = %meta.next_page, cache_pages, "pager.open");
        Ok(Self {
            shared: Arc::new(Shared {
                path,
                table,
                io,
                page_size,
                cache_pages,
                gate,
                panic,
                inner: Mutex::new(Inner {
                    cache: LruCache::unbounded(),
                    dirty: BinaryHeap::new(),
                    next_page: meta.next_page,
                    superblock_dirty: false,
                    closed: false,
                    stats: PagerStats::default(),
                }),
                meta: Mutex::new(meta),
                options,
                flush_lock: Mutex::new(()),
                release_gate: Mutex::new(()),
                released: Condvar::new(),
            }),
        })
    }

    /// Reads the superblock and catalog of an existing file without opening it.
    pub fn read_meta(path: impl AsRef<Path>, provider: &dyn IoProvider) -> Result<Meta> {
        let io = provider.open(path.as_ref(), false, true)?;
        load_meta(io.as_ref())
    }

    /// Table stored in this file.
    pub fn table(&self) -> TableId {
        self.shared.table
    }

    /// Table name from the catalog page.
    pub fn name(&self) -> String {
        self.shared.meta.lock().name.clone()
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    /// Usable bytes after the page header.
    pub fn body_len(&self) -> usize {
        self.shared.page_size - PAGE_HDR_LEN
    }

    /// Pages available to the fragment allocator.
    pub fn data_pages(&self) -> Range<u64> {
        FIRST_DATA_PAGE.0..self.shared.inner.lock().next_page.0
    }

    /// Snapshot of the superblock and catalog fields.
    pub fn meta(&self) -> Meta {
        let mut meta = self.shared.meta.lock().clone();
        meta.next_page = self.shared.inner.lock().next_page;
        meta
    }

    /// Pins `page`. Fails with `Missing` beyond the allocated range and with
    /// `Busy` when a write pin is requested while another is held.
    pub fn pin(&self, page: PageId, mode: PinMode) -> Result<PageHandle> {
        self.shared.panic.check()?;
        if mode == PinMode::Write && self.shared.options.readonly {
            return Err(TesseraError::ReadOnly("table file opened read-only"));
        }
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(TesseraError::bad_argument("page store is closed"));
        }
        if page >= inner.next_page {
            return Err(TesseraError::Missing(page));
        }
        let cached = inner.cache.get(&page).cloned();
        let frame = match cached {
            Some(frame) => {
                inner.stats.hits += 1;
                frame
            }
            None => {
                inner.stats.misses += 1;
                let image = self.read_page(page)?;
                let frame = Arc::new(Frame::new(page, image));
                inner.cache.put(page, Arc::clone(&frame));
                self.evict_over_budget(&mut inner);
                frame
            }
        };
        {
            let mut state = frame.state.lock();
            match mode {
                PinMode::Write if state.writer => return Err(TesseraError::Busy(page)),
                PinMode::Write => state.writer = true,
                PinMode::Read => state.readers += 1,
            }
        }
        Ok(PageHandle {
            shared: Arc::clone(&self.shared),
            frame,
            mode,
            marked: Cell::new(None),
        })
    }

    /// Like [`PageStore::pin`] but waits up to `timeout` for a write pin
    /// held elsewhere to be released.
    pub fn pin_blocking(&self, page: PageId, mode: PinMode, timeout: Duration) -> Result<PageHandle> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut gate = self.shared.release_gate.lock();
            match self.pin(page, mode) {
                Err(TesseraError::Busy(_)) => {}
                other => return other,
            }
            if self
                .shared
                .released
                .wait_until(&mut gate, deadline)
                .timed_out()
            {
                return Err(TesseraError::LockTimeout(timeout));
            }
        }
    }

    /// Extends the file by one formatted page and returns it write-pinned.
    /// The caller must mark it dirty before releasing it.
    ///
    /// The formatted image reaches the file before the page counts as
    /// allocated, so every page below the persisted `next_page` has a
    /// checksummed image on disk and a zeroed or missing one is corruption.
    pub fn allocate(&self, kind: PageKind) -> Result<PageHandle> {
        self.shared.panic.check()?;
        if self.shared.options.readonly {
            return Err(TesseraError::ReadOnly("table file opened read-only"));
        }
        let page = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(TesseraError::bad_argument("page store is closed"));
            }
            let page = inner.next_page;
            let image = fresh_image(self.shared.page_size, kind, page)?;
            self.guarded(write_image(
                self.shared.io.as_ref(),
                page,
                image.clone(),
                self.shared.options.compress,
            ))?;
            inner.next_page = PageId(page.0 + 1);
            inner.superblock_dirty = true;
            inner.cache.put(page, Arc::new(Frame::new(page, image)));
            page
        };
        debug!(table = self.shared.table.0, page = %page, "pager.allocate");
        self.pin(page, PinMode::Write)
    }

    /// Writes back every page that became dirty at or before `lsn`, then
    /// fsyncs the file. Each image waits on the log first.
    ///
    /// Pages are selected by rec-LSN, not by their current page-LSN: a page
    /// first dirtied at or before `lsn` is written even if later changes
    /// pushed its page-LSN past `lsn`. The gate fsyncs the log through the
    /// page-LSN before the write, so the WAL rule still holds, and a page
    /// that is modified continuously is still written back by every
    /// checkpoint.
    pub fn flush_up_to(&self, lsn: Lsn) -> Result<usize> {
        self.shared.panic.check()?;
        if self.shared.options.readonly {
            return Ok(0);
        }
        let _flush = self.shared.flush_lock.lock();
        let (batch, superblock) = {
            let mut inner = self.shared.inner.lock();
            let mut batch = Vec::new();
            while let Some(Reverse((rec_lsn, page))) = inner.dirty.peek().copied() {
                if rec_lsn > lsn {
                    break;
                }
                inner.dirty.pop();
                if let Some(frame) = inner.cache.peek(&page) {
                    batch.push((rec_lsn, Arc::clone(frame)));
                }
            }
            let superblock = std::mem::take(&mut inner.superblock_dirty);
            (batch, superblock)
        };
        let mut written = 0;
        for (rec_lsn, frame) in batch {
            let (image, page_lsn) = {
                let data = frame.data.read();
                let mut state = frame.state.lock();
                if state.rec_lsn != Some(rec_lsn) {
                    continue;
                }
                state.rec_lsn = None;
                (data.to_vec(), page::page_lsn(&data))
            };
            if !page_lsn.is_zero() {
                self.shared.gate.fsync_through(page_lsn)?;
            }
            self.guarded(write_image(
                self.shared.io.as_ref(),
                frame.id,
                image,
                self.shared.options.compress,
            ))?;
            written += 1;
        }
        if written > 0 || superblock {
            self.guarded(self.shared.io.sync_all())?;
        }
        if superblock {
            self.write_superblock()?;
        }
        {
            let mut inner = self.shared.inner.lock();
            inner.stats.writebacks += written as u64;
            self.evict_over_budget(&mut inner);
        }
        debug!(table = self.shared.table.0, upto = %lsn, written, "pager.flush");
        Ok(written)
    }

    /// Flushes everything and marks the store closed. Fails while any page
    /// is pinned.
    pub fn close(&self) -> Result<()> {
        {
            let inner = self.shared.inner.lock();
            if inner.closed {
                return Ok(());
            }
            if let Some((page, _)) = inner.cache.iter().find(|(_, f)| f.state.lock().is_pinned()) {
                return Err(TesseraError::bad_argument(format!(
                    "cannot close {} while page {page} is pinned",
                    self.shared.path.display()
                )));
            }
        }
        if !self.shared.panic.is_tripped() {
            self.flush_up_to(Lsn::MAX)?;
        }
        self.shared.inner.lock().closed = true;
        debug!(path = %self.shared.path.display(), "pager.close");
        Ok(())
    }

    /// Current counters.
    pub fn stats(&self) -> PagerStats {
        let inner = self.shared.inner.lock();
        let mut stats = inner.stats.clone();
        stats.cached_pages = inner.cache.len();
        stats.dirty_pages = inner
            .cache
            .iter()
            .filter(|(_, f)| f.state.lock().rec_lsn.is_some())
            .count();
        stats.next_page = inner.next_page.0;
        stats
    }

    /// Reads and verifies a page straight from the file, bypassing the cache.
    /// Pages below `next_page` always have an image on disk, so a short file
    /// or a zeroed block is `Corrupt`.
    pub fn read_page(&self, page: PageId) -> Result<Vec<u8>> {
        let ps = self.shared.page_size;
        let offset = page.0 * ps as u64;
        let len = self.shared.io.len()?;
        if offset + ps as u64 > len {
            return Err(TesseraError::corrupt(format!(
                "page {page} lies past the end of {} ({len} bytes)",
                self.shared.path.display()
            )));
        }
        let mut buf = vec![0u8; ps];
        self.shared.io.read_at(offset, &mut buf)?;
        decode_image(page, buf)
    }

    fn write_superblock(&self) -> Result<()> {
        let mut meta = self.meta();
        meta.page_size = self.shared.page_size as u32;
        let mut sb = vec![0u8; self.shared.page_size];
        meta::write_superblock(&mut sb, &meta)?;
        self.guarded(write_image(self.shared.io.as_ref(), SUPERBLOCK_PAGE, sb, false))?;
        self.guarded(self.shared.io.sync_all())
    }

    fn evict_over_budget(&self, inner: &mut Inner) {
        let excess = inner.cache.len().saturating_sub(self.shared.cache_pages);
        if excess == 0 {
            return;
        }
        let victims: Vec<PageId> = inner
            .cache
            .iter()
            .rev()
            .filter(|(_, frame)| frame.evictable())
            .map(|(page, _)| *page)
            .take(excess)
            .collect();
        for page in &victims {
            inner.cache.pop(page);
        }
        inner.stats.evictions += victims.len() as u64;
        if victims.len() < excess {
            warn!(
                table = self.shared.table.0,
                cached = inner.cache.len(),
                budget = self.shared.cache_pages,
                "pager.cache_over_budget"
            );
        }
    }

    fn guarded<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|err| {
            self.shared
                .panic
                .trip(format!("write to {} failed: {err}", self.shared.path.display()))
        })
    }
}

fn load_meta(io: &dyn FileIo) -> Result<Meta> {
    let mut probe = vec![0u8; SUPERBLOCK_PROBE_LEN];
    io.read_at(0, &mut probe)?;
    let page_size = meta::probe_page_size(&probe)? as usize;
    if io.len()? < 2 * page_size as u64 {
        return Err(TesseraError::corrupt("table file shorter than its fixed pages"));
    }
    let mut sb = vec![0u8; page_size];
    io.read_at(0, &mut sb)?;
    let mut meta = meta::read_superblock(&decode_image(SUPERBLOCK_PAGE, sb)?)?;
    let mut cat = vec![0u8; page_size];
    io.read_at(meta.catalog_root.0 * page_size as u64, &mut cat)?;
    meta::read_catalog(&decode_image(meta.catalog_root, cat)?, &mut meta)?;
    Ok(meta)
}

fn fresh_image(page_size: usize, kind: PageKind, page: PageId) -> Result<Vec<u8>> {
    let mut image = vec![0u8; page_size];
    PageHeader::new(kind, page).encode(&mut image)?;
    Ok(image)
}

fn write_image(io: &dyn FileIo, page: PageId, mut image: Vec<u8>, compress: bool) -> Result<()> {
    let page_size = image.len();
    if compress {
        let packed = snap::raw::Encoder::new()
            .compress_vec(&image[PAGE_HDR_LEN..])
            .map_err(|err| TesseraError::corrupt(format!("page compression failed: {err}")))?;
        if 4 + packed.len() < page_size - PAGE_HDR_LEN {
            let body = &mut image[PAGE_HDR_LEN..];
            body.fill(0);
            le::put_u32(body, packed.len() as u32);
            body[4..4 + packed.len()].copy_from_slice(&packed);
            image[page::header::FLAGS] |= FLAG_COMPRESSED;
        }
    }
    let sum = page_checksum(&image);
    le::put_u64(&mut image[page::header::CHECKSUM], sum);
    io.write_at(page.0 * page_size as u64, &image)
}

fn decode_image(page: PageId, mut image: Vec<u8>) -> Result<Vec<u8>> {
    let header = PageHeader::decode(&image)
        .map_err(|err| TesseraError::corrupt(format!("page {page}: {err}")))?;
    if header.page_no != page {
        return Err(TesseraError::corrupt(format!(
            "page {page} claims to be page {}",
            header.page_no
        )));
    }
    if page_checksum(&image) != header.checksum {
        return Err(TesseraError::corrupt(format!("page {page} checksum mismatch")));
    }
    if header.flags & FLAG_COMPRESSED != 0 {
        let body_len = image.len() - PAGE_HDR_LEN;
        let packed_len = le::get_u32(&image[PAGE_HDR_LEN..]) as usize;
        let packed = image
            .get(PAGE_HDR_LEN + 4..PAGE_HDR_LEN + 4 + packed_len)
            .ok_or_else(|| TesseraError::corrupt(format!("page {page} compressed length")))?;
        let body = snap::raw::Decoder::new()
            .decompress_vec(packed)
            .map_err(|err| TesseraError::corrupt(format!("page {page} decompression: {err}")))?;
        if body.len() != body_len {
            return Err(TesseraError::corrupt(format!(
                "page {page} decompressed to {} bytes",
                body.len()
            )));
        }
        image[PAGE_HDR_LEN..].copy_from_slice(&body);
        image[page::header::FLAGS] &= !FLAG_COMPRESSED;
    }
    Ok(image)
}

/// A pinned page. Dropping it releases the pin.
pub struct PageHandle {
    shared: Arc<Shared>,
    frame: Arc<Frame>,
    mode: PinMode,
    marked: Cell<Option<Lsn>>,
}

impl PageHandle {
    /// Page number.
    pub fn id(&self) -> PageId {
        self.frame.id
    }

    /// Mode the page was pinned with.
    pub fn mode(&self) -> PinMode {
        self.mode
    }

    /// Shared access to the page image.
    pub fn read(&self) -> Result<PageRead<'_>> {
        let key = (self.shared.table, self.frame.id);
        lock_order::enter(key)?;
        Ok(PageRead {
            data: self.frame.data.read(),
            key,
        })
    }

    /// Exclusive access to the page image; requires a write pin.
    pub fn write(&self) -> Result<PageWrite<'_>> {
        if self.mode != PinMode::Write {
            return Err(TesseraError::bad_argument(format!(
                "page {} is pinned for read",
                self.frame.id
            )));
        }
        let key = (self.shared.table, self.frame.id);
        lock_order::enter(key)?;
        Ok(PageWrite {
            data: self.frame.data.write(),
            handle: self,
            key,
        })
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        {
            let mut state = self.frame.state.lock();
            match self.mode {
                PinMode::Read => state.readers = state.readers.saturating_sub(1),
                PinMode::Write => state.writer = false,
            }
        }
        if self.mode == PinMode::Write {
            let _gate = self.shared.release_gate.lock();
            self.shared.released.notify_all();
        }
    }
}

/// Shared view of a pinned page.
pub struct PageRead<'a> {
    data: FairReadGuard<'a, Vec<u8>>,
    key: (TableId, PageId),
}

impl PageRead<'_> {
    /// Bytes after the page header.
    pub fn body(&self) -> &[u8] {
        &self.data[PAGE_HDR_LEN..]
    }

    /// Page kind from the header.
    pub fn kind(&self) -> Result<PageKind> {
        page::page_kind(&self.data)
    }

    /// LSN of the last modification.
    pub fn page_lsn(&self) -> Lsn {
        page::page_lsn(&self.data)
    }
}

impl Deref for PageRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PageRead<'_> {
    fn drop(&mut self) {
        lock_order::exit(self.key);
    }
}

/// Exclusive view of a write-pinned page.
pub struct PageWrite<'a> {
    data: FairWriteGuard<'a, Vec<u8>>,
    handle: &'a PageHandle,
    key: (TableId, PageId),
}

impl PageWrite<'_> {
    /// Bytes after the page header.
    pub fn body(&self) -> &[u8] {
        &self.data[PAGE_HDR_LEN..]
    }

    /// Mutable bytes after the page header.
    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HDR_LEN..]
    }

    /// Page kind from the header.
    pub fn kind(&self) -> Result<PageKind> {
        page::page_kind(&self.data)
    }

    /// Retags the page; takes effect with the next [`PageWrite::mark_dirty`].
    pub fn set_kind(&mut self, kind: PageKind) {
        page::set_page_kind(&mut self.data, kind);
    }

    /// LSN of the last modification.
    pub fn page_lsn(&self) -> Lsn {
        page::page_lsn(&self.data)
    }

    /// Stamps the page with `lsn` and queues it for write-back. `lsn` must
    /// exceed the current page-LSN unless this pin already stamped it.
    pub fn mark_dirty(&mut self, lsn: Lsn) -> Result<()> {
        let current = page::page_lsn(&self.data);
        let restamp = lsn == current && self.handle.marked.get() == Some(lsn);
        if lsn <= current && !restamp {
            return Err(TesseraError::bad_argument(format!(
                "page {} lsn {lsn} does not advance {current}",
                self.handle.frame.id
            )));
        }
        page::set_page_lsn(&mut self.data, lsn);
        self.handle.marked.set(Some(lsn));
        let newly_dirty = {
            let mut state = self.handle.frame.state.lock();
            if state.rec_lsn.is_none() {
                state.rec_lsn = Some(lsn);
                true
            } else {
                false
            }
        };
        if newly_dirty {
            self.handle
                .shared
                .inner
                .lock()
                .dirty
                .push(Reverse((lsn, self.handle.frame.id)));
        }
        Ok(())
    }
}

impl Deref for PageWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PageWrite<'_> {
    fn drop(&mut self) {
        lock_order::exit(self.key);
    }
}

#[cfg(debug_assertions)]
mod lock_order {
    use std::cell::RefCell;

    use crate::types::{PageId, Result, TableId, TesseraError};

    thread_local! {
        static HELD: RefCell<Vec<(TableId, PageId)>> = const { RefCell::new(Vec::new()) };
    }

    pub fn enter(key: (TableId, PageId)) -> Result<()> {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(max) = held.iter().max().copied() {
                if max > key {
                    return Err(TesseraError::LockOrderViolation {
                        held: max.1,
                        requested: key.1,
                    });
                }
            }
            held.push(key);
            Ok(())
        })
    }

    pub fn exit(key: (TableId, PageId)) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|k| *k == key) {
                held.remove(pos);
            }
        });
    }
}

#[cfg(not(debug_assertions))]
mod lock_order {
    use crate::types::{PageId, Result, TableId};

    pub fn enter(_key: (TableId, PageId)) -> Result<()> {
        Ok(())
    }

    pub fn exit(_key: (TableId, PageId)) {}
}
