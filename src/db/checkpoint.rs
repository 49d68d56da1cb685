//! Fuzzy checkpoints and recovery-start discovery.
//!
//! A checkpoint appends `CHECKPOINT_BEGIN` (at LSN `B`) while holding the
//! transaction table exclusively, writes back every page dirtied at or
//! before `B`, then appends `CHECKPOINT_END` carrying `B`, the previous
//! `CHECKPOINT_END`, and the transactions active at `B`, and fsyncs it.
//! The ENDs form a backward chain that discovery walks.

use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::store::StoreInner;
use crate::primitives::wal::{ActiveTxn, LogRecord, RecordBody, Wal};
use crate::types::{Lsn, Result, TesseraError};

/// Summary of one completed checkpoint.
#[derive(Clone, Debug, Serialize)]
pub struct CheckpointInfo {
    /// LSN of `CHECKPOINT_BEGIN`; the checkpoint's own LSN.
    pub begin: Lsn,
    /// LSN of `CHECKPOINT_END`.
    pub end: Lsn,
    /// Previous `CHECKPOINT_END`, zero for the first.
    pub prev_end: Lsn,
    /// Transactions active at `begin`.
    pub active: usize,
    /// Page images written back.
    pub pages_written: usize,
}

#[derive(Default)]
pub(crate) struct CheckpointState {
    pub last_end: Lsn,
    pub last: Option<CheckpointInfo>,
    pub completed: u64,
}

/// Where recovery must start scanning.
#[derive(Clone, Debug, Default)]
pub(crate) struct Discovery {
    /// `BEGIN` LSN of the chosen checkpoint, or the oldest log record.
    pub start: Lsn,
    /// `(begin, end)` of the chosen checkpoint, if one qualified.
    pub anchor: Option<(Lsn, Lsn)>,
    /// Active table of the chosen checkpoint.
    pub active: Vec<ActiveTxn>,
}

impl Discovery {
    /// Earliest record recovery needs: the start or any listed transaction's
    /// first record.
    pub fn scan_from(&self) -> Lsn {
        self.active
            .iter()
            .map(|txn| txn.first_lsn)
            .fold(self.start, Lsn::min)
    }
}

/// Summary returned by [`Store::archive`](super::Store::archive).
#[derive(Clone, Debug, Default, Serialize)]
pub struct ArchiveReport {
    /// Every record the store may still need is at or after this LSN.
    pub cutoff: Lsn,
    /// Log files that are (or, for a dry run, would be) deleted.
    pub files: Vec<PathBuf>,
    /// Files were actually deleted.
    pub removed: bool,
}

fn read_end(wal: &Wal, lsn: Lsn) -> Result<Option<(Lsn, Lsn, Vec<ActiveTxn>)>> {
    match wal.read(lsn) {
        Ok(LogRecord {
            body:
                RecordBody::CheckpointEnd {
                    begin,
                    prev_end,
                    active,
                },
            ..
        }) => Ok(Some((begin, prev_end, active))),
        Ok(other) => Err(TesseraError::corrupt(format!(
            "checkpoint chain points at a {} record at {lsn}",
            other.kind().name()
        ))),
        // The chain ran into truncated log files.
        Err(TesseraError::BadArgument(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Finds the checkpoint to start recovery from, given the most recent
/// `CHECKPOINT_END`.
///
/// Let `C` be the `BEGIN` LSN of the most recent checkpoint. Walking back
/// through the END chain, the first checkpoint other than the most recent
/// whose own LSN is at or below `C` is chosen. If the walk runs off the
/// beginning, recovery starts at the oldest log record.
pub(crate) fn discover(wal: &Wal, last_end: Lsn) -> Result<Discovery> {
    let fallback = Discovery {
        start: wal.first_lsn(),
        ..Discovery::default()
    };
    if last_end.is_zero() {
        return Ok(fallback);
    }
    let Some((newest_begin, mut cursor, _)) = read_end(wal, last_end)? else {
        return Ok(fallback);
    };
    while !cursor.is_zero() {
        let Some((begin, prev_end, active)) = read_end(wal, cursor)? else {
            break;
        };
        if begin <= newest_begin {
            return Ok(Discovery {
                start: begin,
                anchor: Some((begin, cursor)),
                active,
            });
        }
        cursor = prev_end;
    }
    Ok(fallback)
}

impl StoreInner {
    /// Runs a checkpoint.
    pub(crate) fn checkpoint(&self) -> Result<CheckpointInfo> {
        self.checkpoint_with(|_| Ok(()))
    }

    /// Runs a checkpoint, calling `stage` with the `BEGIN` LSN before pages
    /// are written back. Recovery uses it to install replayed rows.
    pub(crate) fn checkpoint_with(
        &self,
        stage: impl FnOnce(Lsn) -> Result<()>,
    ) -> Result<CheckpointInfo> {
        self.panic.check()?;
        if self.options.readonly {
            return Err(TesseraError::ReadOnly("store opened read-only"));
        }
        let mut state = self.checkpoints.lock();
        let prev_end = state.last_end;
        let (begin, active) = {
            let txns = self.txns.write();
            let begin = self
                .wal
                .append(&LogRecord::standalone(RecordBody::CheckpointBegin { prev_end }))?;
            (begin, txns.active())
        };
        debug!(lsn = %begin, active = active.len(), "checkpoint.begin");
        stage(begin)?;
        let mut pages_written = 0;
        for table in self.tables() {
            pages_written += table.pages.flush_up_to(begin)?;
        }
        let active_count = active.len();
        let end = self
            .wal
            .append(&LogRecord::standalone(RecordBody::CheckpointEnd {
                begin,
                prev_end,
                active,
            }))?;
        self.wal.fsync_through(end)?;
        let info = CheckpointInfo {
            begin,
            end,
            prev_end,
            active: active_count,
            pages_written,
        };
        state.last_end = end;
        state.last = Some(info.clone());
        state.completed += 1;
        info!(begin = %begin, end = %end, pages = pages_written, active = active_count, "checkpoint.end");
        Ok(info)
    }

    /// Deletes log files no longer needed for recovery, or lists them when
    /// `dry_run` is set. Nothing is removed until two checkpoints exist.
    pub(crate) fn archive(&self, dry_run: bool) -> Result<ArchiveReport> {
        self.panic.check()?;
        if self.options.readonly && !dry_run {
            return Err(TesseraError::ReadOnly("store opened read-only"));
        }
        let last_end = self.checkpoints.lock().last_end;
        let discovery = discover(&self.wal, last_end)?;
        if discovery.anchor.is_none() {
            return Ok(ArchiveReport {
                cutoff: self.wal.first_lsn(),
                ..ArchiveReport::default()
            });
        }
        let mut cutoff = discovery.scan_from();
        if let Some(oldest) = self.txns.read().oldest_first_lsn() {
            cutoff = cutoff.min(oldest);
        }
        let (files, removed) = if dry_run {
            (self.wal.files_before(cutoff), false)
        } else {
            (self.wal.truncate_before(cutoff)?, true)
        };
        info!(cutoff = %cutoff, files = files.len(), dry_run, "archive");
        Ok(ArchiveReport {
            cutoff,
            files,
            removed,
        })
    }
}

/// Background thread running a checkpoint every interval.
pub(crate) struct Checkpointer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    pub fn spawn(store: Weak<StoreInner>, interval: Duration) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("tessera-checkpoint".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(store) = store.upgrade() else { break };
                        if store.panic.is_tripped() {
                            break;
                        }
                        if let Err(err) = store.checkpoint() {
                            warn!(error = %err, "checkpoint.background_failed");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    pub fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
