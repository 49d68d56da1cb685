#![forbid(unsafe_code)]
//! Segmented write-ahead log.
//!
//! Records are appended to an in-memory tail under one mutex and assigned an
//! LSN `(file, offset)` immediately. A single writer thread drains the tail
//! into `log.NNNNNNNN` files under the store's `log/` directory and performs
//! every fsync, so concurrent
//! `fsync_through` callers share one physical sync.

mod record;

pub use record::{
    ActiveTxn, BroadcastEntry, LogRecord, RecordBody, RecordKind, MAX_RECORD_LEN,
    MIN_RECORD_LEN,
};

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::bytes::le;
use crate::primitives::concurrency::PanicState;
use crate::primitives::io::{FileIo, IoProvider};
use crate::types::checksum::record_crc32;
use crate::types::{Lsn, Result, TesseraError};

const LOG_MAGIC: [u8; 4] = *b"TSLG";
const LOG_FORMAT_VERSION: u16 = 1;
/// Bytes at the start of every log file before the first record.
pub const LOG_HEADER_LEN: u32 = 16;
/// Smallest accepted rollover size.
pub const MIN_ROLLOVER_SIZE: u64 = 64 << 10;
/// Largest accepted rollover size; offsets must stay within 32 bits.
pub const MAX_ROLLOVER_SIZE: u64 = 1 << 31;
/// Buffered bytes that wake the writer even without a sync request.
const WRITE_BEHIND_BYTES: usize = 1 << 20;

/// Directory inside a store that holds the log files.
pub const LOG_DIR: &str = "log";

/// File name for log file number `file`.
pub fn log_file_name(file: u32) -> String {
    format!("log.{file:08}")
}

/// Parses a `log.NNNNNNNN` file name.
pub fn parse_log_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("log.")?;
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Configuration for opening a log directory.
#[derive(Clone, Debug)]
pub struct WalOptions {
    /// Start a new file once the current one would exceed this many bytes.
    pub rollover_size: u64,
    /// How long the writer lingers after a sync request to collect more.
    pub group_commit_wait: Duration,
    /// Open without a writer; appends fail.
    pub readonly: bool,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            rollover_size: 16 << 20,
            group_commit_wait: Duration::ZERO,
            readonly: false,
        }
    }
}

impl WalOptions {
    fn validate(&self) -> Result<()> {
        if !(MIN_ROLLOVER_SIZE..=MAX_ROLLOVER_SIZE).contains(&self.rollover_size) {
            return Err(TesseraError::bad_argument(format!(
                "log_rollover_size {} outside {}..={}",
                self.rollover_size, MIN_ROLLOVER_SIZE, MAX_ROLLOVER_SIZE
            )));
        }
        Ok(())
    }
}

/// Counters describing log activity.
#[derive(Clone, Debug, Default, Serialize)]
pub struct WalStats {
    /// Records appended since open.
    pub records_appended: u64,
    /// Encoded bytes appended since open.
    pub bytes_appended: u64,
    /// Physical fsync calls issued by the writer.
    pub fsyncs: u64,
    /// Drain passes completed by the writer.
    pub drains: u64,
    /// Log files currently retained.
    pub files: usize,
    /// Oldest retained record position.
    pub first_lsn: Lsn,
    /// Position the next record will receive.
    pub next_lsn: Lsn,
    /// Everything before this position is fsynced.
    pub durable_lsn: Lsn,
}

struct FileHeader {
    file_no: u32,
}

impl FileHeader {
    fn encode(&self) -> [u8; LOG_HEADER_LEN as usize] {
        let mut buf = [0u8; LOG_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&LOG_MAGIC);
        le::put_u16(&mut buf[4..6], LOG_FORMAT_VERSION);
        le::put_u32(&mut buf[8..12], self.file_no);
        let crc = record_crc32(&buf[..12]);
        le::put_u32(&mut buf[12..16], crc);
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < LOG_HEADER_LEN as usize {
            return Err(TesseraError::corrupt("log file header truncated"));
        }
        if src[0..4] != LOG_MAGIC {
            return Err(TesseraError::corrupt("log file magic mismatch"));
        }
        if le::get_u16(&src[4..6]) != LOG_FORMAT_VERSION {
            return Err(TesseraError::corrupt("log format version mismatch"));
        }
        if record_crc32(&src[..12]) != le::get_u32(&src[12..16]) {
            return Err(TesseraError::corrupt("log file header checksum mismatch"));
        }
        Ok(Self {
            file_no: le::get_u32(&src[8..12]),
        })
    }
}

struct TailChunk {
    file: u32,
    start: u32,
    bytes: Vec<u8>,
}

impl TailChunk {
    fn end(&self) -> u32 {
        self.start + self.bytes.len() as u32
    }

    fn frame_at(&self, lsn: Lsn) -> Result<Option<&[u8]>> {
        if self.file != lsn.file() || lsn.offset() < self.start || lsn.offset() >= self.end() {
            return Ok(None);
        }
        let rel = (lsn.offset() - self.start) as usize;
        let prefix = self
            .bytes
            .get(rel..rel + 4)
            .ok_or_else(|| TesseraError::corrupt(format!("no record boundary at {lsn}")))?;
        let len = LogRecord::frame_len(prefix)?;
        self.bytes
            .get(rel..rel + len)
            .map(Some)
            .ok_or_else(|| TesseraError::corrupt(format!("no record boundary at {lsn}")))
    }
}

struct TailState {
    next_lsn: Lsn,
    chunks: Vec<TailChunk>,
    in_flight: Option<Arc<Vec<TailChunk>>>,
    buffered: usize,
    durable_lsn: Lsn,
    syncing_to: Option<Lsn>,
    sync_requested: bool,
    first_file: u32,
    shutdown: bool,
}

#[derive(Default)]
struct Counters {
    records: AtomicU64,
    bytes: AtomicU64,
    fsyncs: AtomicU64,
    drains: AtomicU64,
}

struct Shared {
    dir: PathBuf,
    provider: Arc<dyn IoProvider>,
    options: WalOptions,
    panic: Arc<PanicState>,
    tail: Mutex<TailState>,
    wakeup: Condvar,
    durable: Condvar,
    files: Mutex<BTreeMap<u32, Arc<dyn FileIo>>>,
    counters: Counters,
}

/// Handle on an open log directory.
pub struct Wal {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Opens (or initializes) the log in `dir`, trimming a torn tail.
    pub fn open(
        dir: impl AsRef<Path>,
        provider: Arc<dyn IoProvider>,
        options: WalOptions,
        panic: Arc<PanicState>,
    ) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        if !options.readonly {
            fs::create_dir_all(&dir)?;
        }
        let mut numbers = Vec::new();
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if let Some(no) = entry.file_name().to_str().and_then(parse_log_file_name) {
                    numbers.push(no);
                }
            }
        }
        numbers.sort_unstable();
        for pair in numbers.windows(2) {
            if pair[1] != pair[0] + 1 {
                return Err(TesseraError::corrupt(format!(
                    "log file {} missing between {} and {}",
                    pair[0] + 1,
                    pair[0],
                    pair[1]
                )));
            }
        }

        let mut files: BTreeMap<u32, Arc<dyn FileIo>> = BTreeMap::new();
        let next_lsn = match numbers.last().copied() {
            None if options.readonly => Lsn::new(1, LOG_HEADER_LEN),
            None => {
                let io = provider.open(&dir.join(log_file_name(1)), true, false)?;
                io.write_at(0, &FileHeader { file_no: 1 }.encode())?;
                io.sync_all()?;
                files.insert(1, io);
                info!(dir = %dir.display(), "wal.open.initialized");
                Lsn::new(1, LOG_HEADER_LEN)
            }
            Some(last) => {
                for no in &numbers {
                    let io = provider.open(&dir.join(log_file_name(*no)), false, options.readonly)?;
                    let mut header = [0u8; LOG_HEADER_LEN as usize];
                    io.read_at(0, &mut header)?;
                    let decoded = FileHeader::decode(&header)?;
                    if decoded.file_no != *no {
                        return Err(TesseraError::corrupt(format!(
                            "log file {} claims number {}",
                            log_file_name(*no),
                            decoded.file_no
                        )));
                    }
                    files.insert(*no, io);
                }
                let last_io = Arc::clone(&files[&last]);
                let len = last_io.len()?;
                let end = valid_end(last_io.as_ref(), len)?;
                if u64::from(end) < len {
                    warn!(file = last, valid = end, len, "wal.open.torn_tail");
                    if !options.readonly {
                        last_io.truncate(u64::from(end))?;
                        last_io.sync_all()?;
                    }
                }
                Lsn::new(last, end)
            }
        };
        let first_file = numbers.first().copied().unwrap_or(1);
        let shared = Arc::new(Shared {
            dir,
            provider,
            panic,
            tail: Mutex::new(TailState {
                next_lsn,
                chunks: Vec::new(),
                in_flight: None,
                buffered: 0,
                durable_lsn: next_lsn,
                syncing_to: None,
                sync_requested: false,
                first_file,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            durable: Condvar::new(),
            files: Mutex::new(files),
            counters: Counters::default(),
            options,
        });
        let writer = if shared.options.readonly {
            None
        } else {
            let worker = Arc::clone(&shared);
            Some(
                thread::Builder::new()
                    .name("tessera-wal-writer".into())
                    .spawn(move || writer_loop(worker))?,
            )
        };
        debug!(next = %next_lsn, first_file, "wal.open");
        Ok(Self {
            shared,
            writer: Mutex::new(writer),
        })
    }

    /// Appends `record` to the tail and returns its LSN. Does not wait for
    /// durability.
    pub fn append(&self, record: &LogRecord) -> Result<Lsn> {
        self.shared.panic.check()?;
        if self.shared.options.readonly {
            return Err(TesseraError::ReadOnly("log opened read-only"));
        }
        let bytes = record.encode()?;
        let mut tail = self.shared.tail.lock();
        if tail.shutdown {
            return Err(TesseraError::bad_argument("log is closed"));
        }
        let mut lsn = tail.next_lsn;
        let would_end = u64::from(lsn.offset()) + bytes.len() as u64;
        if lsn.offset() > LOG_HEADER_LEN && would_end > self.shared.options.rollover_size {
            let file = lsn
                .file()
                .checked_add(1)
                .ok_or_else(|| TesseraError::bad_argument("log file numbers exhausted"))?;
            tail.chunks.push(TailChunk {
                file,
                start: 0,
                bytes: FileHeader { file_no: file }.encode().to_vec(),
            });
            lsn = Lsn::new(file, LOG_HEADER_LEN);
            debug!(file, "wal.rollover");
        }
        match tail.chunks.last_mut() {
            Some(chunk) if chunk.file == lsn.file() && chunk.end() == lsn.offset() => {
                chunk.bytes.extend_from_slice(&bytes);
            }
            _ => tail.chunks.push(TailChunk {
                file: lsn.file(),
                start: lsn.offset(),
                bytes: bytes.clone(),
            }),
        }
        tail.next_lsn = Lsn::new(lsn.file(), lsn.offset() + bytes.len() as u32);
        tail.buffered += bytes.len();
        if tail.buffered >= WRITE_BEHIND_BYTES {
            self.shared.wakeup.notify_one();
        }
        drop(tail);
        let counters = &self.shared.counters;
        counters.records.fetch_add(1, Ordering::Relaxed);
        counters
            .bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        debug!(lsn = %lsn, kind = record.kind().name(), txn = record.txn.0, "wal.append");
        Ok(lsn)
    }

    /// Blocks until the record at `lsn` is durable.
    pub fn fsync_through(&self, lsn: Lsn) -> Result<()> {
        let mut tail = self.shared.tail.lock();
        loop {
            self.shared.panic.check()?;
            if tail.durable_lsn > lsn {
                return Ok(());
            }
            if lsn >= tail.next_lsn {
                return Err(TesseraError::bad_argument(format!(
                    "fsync_through({lsn}) beyond end of log {}",
                    tail.next_lsn
                )));
            }
            let covered = tail.syncing_to.is_some_and(|end| lsn < end);
            if !covered && !tail.sync_requested {
                tail.sync_requested = true;
                self.shared.wakeup.notify_one();
            }
            self.shared.durable.wait(&mut tail);
        }
    }

    /// Makes everything appended so far durable.
    pub fn flush(&self) -> Result<()> {
        let last = {
            let tail = self.shared.tail.lock();
            if tail.durable_lsn >= tail.next_lsn {
                return self.shared.panic.check();
            }
            tail.next_lsn
        };
        // Any position below the end works as a target for "everything so far".
        self.fsync_through(Lsn::new(last.file(), last.offset().saturating_sub(1)))
    }

    /// Reads the record stored at `lsn`.
    pub fn read(&self, lsn: Lsn) -> Result<LogRecord> {
        self.shared.panic.check()?;
        {
            let tail = self.shared.tail.lock();
            let in_flight = tail.in_flight.iter().flat_map(|batch| batch.iter());
            for chunk in in_flight.chain(tail.chunks.iter()) {
                if let Some(frame) = chunk.frame_at(lsn)? {
                    return LogRecord::decode(frame);
                }
            }
            if lsn >= tail.next_lsn {
                return Err(TesseraError::bad_argument(format!(
                    "lsn {lsn} beyond end of log {}",
                    tail.next_lsn
                )));
            }
            if lsn < Lsn::new(tail.first_file, LOG_HEADER_LEN) {
                return Err(TesseraError::bad_argument(format!(
                    "lsn {lsn} precedes the oldest retained log file"
                )));
            }
        }
        let io = self.file(lsn.file())?;
        read_frame(io.as_ref(), lsn.offset()).map(|(record, _)| record)
    }

    /// Lazily iterates records from `lsn` (or from the oldest record when
    /// `lsn` is zero) up to the end of the log at call time.
    pub fn scan_from(&self, lsn: Lsn) -> Result<LogScanner> {
        if !self.shared.options.readonly {
            self.flush()?;
        }
        let (first, end) = {
            let tail = self.shared.tail.lock();
            (Lsn::new(tail.first_file, LOG_HEADER_LEN), tail.next_lsn)
        };
        let start = if lsn.is_zero() { first } else { lsn };
        if start < first {
            return Err(TesseraError::bad_argument(format!(
                "scan start {start} precedes first retained record {first}"
            )));
        }
        Ok(LogScanner {
            shared: Arc::clone(&self.shared),
            file: start.file(),
            offset: start.offset(),
            end,
            current: None,
            failed: false,
        })
    }

    /// LSN of the oldest record still on disk.
    pub fn first_lsn(&self) -> Lsn {
        Lsn::new(self.shared.tail.lock().first_file, LOG_HEADER_LEN)
    }

    /// Position the next appended record will receive.
    pub fn end_lsn(&self) -> Lsn {
        self.shared.tail.lock().next_lsn
    }

    /// Everything strictly before this LSN is durable.
    pub fn durable_lsn(&self) -> Lsn {
        self.shared.tail.lock().durable_lsn
    }

    /// Log files that [`Wal::truncate_before`] would delete for `lsn`.
    pub fn files_before(&self, lsn: Lsn) -> Vec<PathBuf> {
        let current = self.end_lsn().file();
        self.shared
            .files
            .lock()
            .keys()
            .filter(|no| **no < lsn.file() && **no < current)
            .map(|no| self.shared.dir.join(log_file_name(*no)))
            .collect()
    }

    /// Deletes whole log files whose records all precede `lsn`. The file
    /// currently being appended to is never removed.
    pub fn truncate_before(&self, lsn: Lsn) -> Result<Vec<PathBuf>> {
        self.shared.panic.check()?;
        if self.shared.options.readonly {
            return Err(TesseraError::ReadOnly("log opened read-only"));
        }
        let current = self.end_lsn().file();
        let mut removed = Vec::new();
        let first_remaining = {
            let mut files = self.shared.files.lock();
            let victims: Vec<u32> = files
                .keys()
                .copied()
                .filter(|no| *no < lsn.file() && *no < current)
                .collect();
            for no in victims {
                files.remove(&no);
                let path = self.shared.dir.join(log_file_name(no));
                fs::remove_file(&path)?;
                removed.push(path);
            }
            files.keys().next().copied().unwrap_or(current)
        };
        self.shared.tail.lock().first_file = first_remaining;
        if !removed.is_empty() {
            info!(
                removed = removed.len(),
                first_file = first_remaining,
                before = %lsn,
                "wal.truncate"
            );
        }
        Ok(removed)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> WalStats {
        let (first_lsn, next_lsn, durable_lsn) = {
            let tail = self.shared.tail.lock();
            (
                Lsn::new(tail.first_file, LOG_HEADER_LEN),
                tail.next_lsn,
                tail.durable_lsn,
            )
        };
        let c = &self.shared.counters;
        WalStats {
            records_appended: c.records.load(Ordering::Relaxed),
            bytes_appended: c.bytes.load(Ordering::Relaxed),
            fsyncs: c.fsyncs.load(Ordering::Relaxed),
            drains: c.drains.load(Ordering::Relaxed),
            files: self.shared.files.lock().len(),
            first_lsn,
            next_lsn,
            durable_lsn,
        }
    }

    /// Directory holding the log files.
    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    fn file(&self, no: u32) -> Result<Arc<dyn FileIo>> {
        self.shared
            .files
            .lock()
            .get(&no)
            .cloned()
            .ok_or_else(|| TesseraError::corrupt(format!("log file {} missing", log_file_name(no))))
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        {
            let mut tail = self.shared.tail.lock();
            tail.shutdown = true;
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                warn!("wal.writer.join_failed");
            }
        }
    }
}

fn writer_loop(shared: Arc<Shared>) {
    let mut unsynced: BTreeSet<u32> = BTreeSet::new();
    loop {
        let (batch, end, sync, exiting) = {
            let mut tail = shared.tail.lock();
            while !(tail.sync_requested || tail.buffered >= WRITE_BEHIND_BYTES || tail.shutdown) {
                shared.wakeup.wait(&mut tail);
            }
            let linger = shared.options.group_commit_wait;
            if tail.sync_requested && !tail.shutdown && !linger.is_zero() {
                shared.wakeup.wait_for(&mut tail, linger);
            }
            let exiting = tail.shutdown;
            if exiting && tail.chunks.is_empty() && unsynced.is_empty() {
                debug!("wal.writer.exit");
                return;
            }
            let batch = Arc::new(std::mem::take(&mut tail.chunks));
            tail.buffered = 0;
            tail.in_flight = Some(Arc::clone(&batch));
            let sync = tail.sync_requested || exiting;
            tail.sync_requested = false;
            let end = tail.next_lsn;
            if sync {
                tail.syncing_to = Some(end);
            }
            (batch, end, sync, exiting)
        };

        let outcome = write_batch(&shared, &batch, &mut unsynced).and_then(|written| {
            let synced = if sync {
                sync_files(&shared, &mut unsynced)?
            } else {
                0
            };
            Ok((written, synced))
        });

        let mut tail = shared.tail.lock();
        tail.in_flight = None;
        tail.syncing_to = None;
        match outcome {
            Ok((written, synced)) => {
                if sync {
                    tail.durable_lsn = end;
                }
                shared.counters.drains.fetch_add(1, Ordering::Relaxed);
                debug!(chunks = written, fsyncs = synced, end = %end, "wal.writer.drain");
                shared.durable.notify_all();
            }
            Err(err) => {
                shared.panic.trip(format!("log write failed: {err}"));
                shared.durable.notify_all();
                return;
            }
        }
        if exiting && tail.chunks.is_empty() {
            debug!("wal.writer.exit");
            return;
        }
    }
}

fn write_batch(shared: &Shared, batch: &[TailChunk], unsynced: &mut BTreeSet<u32>) -> Result<usize> {
    for chunk in batch {
        let io = {
            let mut files = shared.files.lock();
            match files.get(&chunk.file) {
                Some(io) => Arc::clone(io),
                None => {
                    let path = shared.dir.join(log_file_name(chunk.file));
                    let io = shared.provider.open(&path, true, false)?;
                    files.insert(chunk.file, Arc::clone(&io));
                    io
                }
            }
        };
        io.write_at(u64::from(chunk.start), &chunk.bytes)?;
        unsynced.insert(chunk.file);
    }
    Ok(batch.len())
}

fn sync_files(shared: &Shared, unsynced: &mut BTreeSet<u32>) -> Result<usize> {
    let mut synced = 0;
    while let Some(no) = unsynced.pop_first() {
        let io = shared.files.lock().get(&no).cloned();
        // A file truncated away since it was written needs no sync.
        if let Some(io) = io {
            io.sync_all()?;
            shared.counters.fsyncs.fetch_add(1, Ordering::Relaxed);
            synced += 1;
        }
    }
    Ok(synced)
}

fn read_frame(io: &dyn FileIo, offset: u32) -> Result<(LogRecord, u32)> {
    let mut prefix = [0u8; 4];
    io.read_at(u64::from(offset), &mut prefix)?;
    let len = LogRecord::frame_len(&prefix)?;
    let mut frame = vec![0u8; len];
    io.read_at(u64::from(offset), &mut frame)?;
    Ok((LogRecord::decode(&frame)?, len as u32))
}

/// Offset just past the last intact record of a log file.
fn valid_end(io: &dyn FileIo, len: u64) -> Result<u32> {
    let mut offset = LOG_HEADER_LEN;
    loop {
        if u64::from(offset) + MIN_RECORD_LEN as u64 > len {
            return Ok(offset);
        }
        let mut prefix = [0u8; 4];
        io.read_at(u64::from(offset), &mut prefix)?;
        let Ok(frame_len) = LogRecord::frame_len(&prefix) else {
            return Ok(offset);
        };
        if u64::from(offset) + frame_len as u64 > len {
            return Ok(offset);
        }
        let mut frame = vec![0u8; frame_len];
        io.read_at(u64::from(offset), &mut frame)?;
        if LogRecord::decode(&frame).is_err() {
            return Ok(offset);
        }
        offset += frame_len as u32;
    }
}

/// Forward iterator over log records produced by [`Wal::scan_from`].
pub struct LogScanner {
    shared: Arc<Shared>,
    file: u32,
    offset: u32,
    end: Lsn,
    current: Option<(Arc<dyn FileIo>, u64)>,
    failed: bool,
}

impl LogScanner {
    fn open_current(&mut self) -> Result<Option<u64>> {
        if let Some((_, len)) = &self.current {
            return Ok(Some(*len));
        }
        let io = self.shared.files.lock().get(&self.file).cloned();
        let Some(io) = io else {
            return Ok(None);
        };
        let len = io.len()?;
        self.current = Some((io, len));
        Ok(Some(len))
    }

    fn advance(&mut self) -> Result<Option<(Lsn, LogRecord)>> {
        loop {
            let at = Lsn::new(self.file, self.offset);
            if at >= self.end {
                return Ok(None);
            }
            let Some(len) = self.open_current()? else {
                return Err(TesseraError::corrupt(format!(
                    "log file {} missing during scan",
                    log_file_name(self.file)
                )));
            };
            if u64::from(self.offset) >= len {
                self.file += 1;
                self.offset = LOG_HEADER_LEN;
                self.current = None;
                continue;
            }
            let Some((io, _)) = &self.current else {
                continue;
            };
            let (record, frame_len) = read_frame(io.as_ref(), self.offset)?;
            self.offset += frame_len;
            return Ok(Some((at, record)));
        }
    }
}

impl Iterator for LogScanner {
    type Item = Result<(Lsn, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
