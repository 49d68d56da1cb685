//! Log record kinds, typed bodies, and the on-disk framing.
//!
//! Frame: `[total-length u32][kind u8][txn u64][prev-LSN u64][payload][crc32 u32]`,
//! little-endian, with the CRC covering everything before it.

use std::convert::TryFrom;

use crate::primitives::bytes::{buf, le};
use crate::types::checksum::record_crc32;
use crate::types::{Lsn, Result, TableId, TesseraError, TxnId};

/// Bytes preceding the payload.
pub const RECORD_HEADER_LEN: usize = 4 + 1 + 8 + 8;
/// Trailing checksum length.
pub const RECORD_TRAILER_LEN: usize = 4;
/// Smallest valid frame.
pub const MIN_RECORD_LEN: usize = RECORD_HEADER_LEN + RECORD_TRAILER_LEN;
/// Largest frame accepted by the codec.
pub const MAX_RECORD_LEN: usize = 256 << 20;

/// Record type tag.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Transaction start.
    Begin = 1,
    /// Transaction commit (top-level or child).
    Commit = 2,
    /// Transaction abort, written after all compensation records.
    Abort = 3,
    /// Insert or overwrite of one key.
    Put = 4,
    /// Removal of one key.
    Delete = 5,
    /// Read-modify-write of one key through the update callback.
    Update = 6,
    /// Update callback applied to every record of a table.
    UpdateBroadcast = 7,
    /// Start of a checkpoint.
    CheckpointBegin = 8,
    /// End of a checkpoint.
    CheckpointEnd = 9,
    /// Undo of one earlier record during abort.
    Compensate = 10,
}

impl RecordKind {
    /// Upper-case name used by dumps.
    pub fn name(self) -> &'static str {
        match self {
            RecordKind::Begin => "BEGIN",
            RecordKind::Commit => "COMMIT",
            RecordKind::Abort => "ABORT",
            RecordKind::Put => "PUT",
            RecordKind::Delete => "DELETE",
            RecordKind::Update => "UPDATE",
            RecordKind::UpdateBroadcast => "UPDATE_BROADCAST",
            RecordKind::CheckpointBegin => "CHECKPOINT_BEGIN",
            RecordKind::CheckpointEnd => "CHECKPOINT_END",
            RecordKind::Compensate => "COMPENSATE",
        }
    }
}

impl TryFrom<u8> for RecordKind {
    type Error = TesseraError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => RecordKind::Begin,
            2 => RecordKind::Commit,
            3 => RecordKind::Abort,
            4 => RecordKind::Put,
            5 => RecordKind::Delete,
            6 => RecordKind::Update,
            7 => RecordKind::UpdateBroadcast,
            8 => RecordKind::CheckpointBegin,
            9 => RecordKind::CheckpointEnd,
            10 => RecordKind::Compensate,
            other => {
                return Err(TesseraError::corrupt(format!(
                    "unknown log record kind {other}"
                )))
            }
        })
    }
}

/// One row touched by a non-resetting broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastEntry {
    /// Row key.
    pub key: Vec<u8>,
    /// Value before the callback ran.
    pub old: Vec<u8>,
    /// Callback result; `None` deleted the row.
    pub new: Option<Vec<u8>>,
}

/// Transaction listed in a checkpoint's active table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ActiveTxn {
    /// Transaction id.
    pub txn: TxnId,
    /// Parent id, [`TxnId::NONE`] for top-level transactions.
    pub parent: TxnId,
    /// LSN of its `BEGIN` record.
    pub first_lsn: Lsn,
}

/// Typed payload of a log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordBody {
    /// See [`RecordKind::Begin`].
    Begin {
        /// Enclosing transaction or [`TxnId::NONE`].
        parent: TxnId,
        /// Begin flags as stored bits.
        flags: u8,
    },
    /// See [`RecordKind::Commit`].
    Commit {
        /// Parent receiving the effects, or [`TxnId::NONE`] for top-level.
        parent: TxnId,
    },
    /// See [`RecordKind::Abort`].
    Abort,
    /// See [`RecordKind::Put`].
    Put {
        /// Target table.
        table: TableId,
        /// Row key.
        key: Vec<u8>,
        /// Value visible to the writer before the put.
        before: Option<Vec<u8>>,
        /// Written value.
        after: Vec<u8>,
    },
    /// See [`RecordKind::Delete`].
    Delete {
        /// Target table.
        table: TableId,
        /// Row key.
        key: Vec<u8>,
        /// Value visible to the writer before the delete.
        before: Option<Vec<u8>>,
    },
    /// See [`RecordKind::Update`].
    Update {
        /// Target table.
        table: TableId,
        /// Row key.
        key: Vec<u8>,
        /// Argument handed to the callback.
        extra: Vec<u8>,
        /// Value before the callback ran.
        before: Option<Vec<u8>>,
        /// Callback result.
        after: Option<Vec<u8>>,
    },
    /// See [`RecordKind::UpdateBroadcast`].
    UpdateBroadcast {
        /// Target table.
        table: TableId,
        /// Argument handed to the callback.
        extra: Vec<u8>,
        /// Output does not depend on prior values; `entries` is empty.
        resetting: bool,
        /// Old and new images of one page's rows (non-resetting only).
        entries: Vec<BroadcastEntry>,
    },
    /// See [`RecordKind::CheckpointBegin`].
    CheckpointBegin {
        /// LSN of the previous `CHECKPOINT_END`, or zero.
        prev_end: Lsn,
    },
    /// See [`RecordKind::CheckpointEnd`].
    CheckpointEnd {
        /// LSN of the matching `CHECKPOINT_BEGIN`.
        begin: Lsn,
        /// LSN of the previous `CHECKPOINT_END`, or zero.
        prev_end: Lsn,
        /// Transactions active when the checkpoint began.
        active: Vec<ActiveTxn>,
    },
    /// See [`RecordKind::Compensate`].
    Compensate {
        /// LSN of the record being undone.
        undone: Lsn,
    },
}

impl RecordBody {
    /// Tag of this body.
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::Begin { .. } => RecordKind::Begin,
            RecordBody::Commit { .. } => RecordKind::Commit,
            RecordBody::Abort => RecordKind::Abort,
            RecordBody::Put { .. } => RecordKind::Put,
            RecordBody::Delete { .. } => RecordKind::Delete,
            RecordBody::Update { .. } => RecordKind::Update,
            RecordBody::UpdateBroadcast { .. } => RecordKind::UpdateBroadcast,
            RecordBody::CheckpointBegin { .. } => RecordKind::CheckpointBegin,
            RecordBody::CheckpointEnd { .. } => RecordKind::CheckpointEnd,
            RecordBody::Compensate { .. } => RecordKind::Compensate,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut w = buf::Writer::with_capacity(64);
        match self {
            RecordBody::Begin { parent, flags } => {
                w.u64(parent.0).u8(*flags);
            }
            RecordBody::Commit { parent } => {
                w.u64(parent.0);
            }
            RecordBody::Abort => {}
            RecordBody::Put {
                table,
                key,
                before,
                after,
            } => {
                w.u32(table.0).blob(key).opt_blob(before.as_deref()).blob(after);
            }
            RecordBody::Delete { table, key, before } => {
                w.u32(table.0).blob(key).opt_blob(before.as_deref());
            }
            RecordBody::Update {
                table,
                key,
                extra,
                before,
                after,
            } => {
                w.u32(table.0)
                    .blob(key)
                    .blob(extra)
                    .opt_blob(before.as_deref())
                    .opt_blob(after.as_deref());
            }
            RecordBody::UpdateBroadcast {
                table,
                extra,
                resetting,
                entries,
            } => {
                w.u32(table.0)
                    .blob(extra)
                    .u8(u8::from(*resetting))
                    .u32(entries.len() as u32);
                for entry in entries {
                    w.blob(&entry.key)
                        .blob(&entry.old)
                        .opt_blob(entry.new.as_deref());
                }
            }
            RecordBody::CheckpointBegin { prev_end } => {
                w.u64(prev_end.to_u64());
            }
            RecordBody::CheckpointEnd {
                begin,
                prev_end,
                active,
            } => {
                w.u64(begin.to_u64())
                    .u64(prev_end.to_u64())
                    .u32(active.len() as u32);
                for txn in active {
                    w.u64(txn.txn.0)
                        .u64(txn.parent.0)
                        .u64(txn.first_lsn.to_u64());
                }
            }
            RecordBody::Compensate { undone } => {
                w.u64(undone.to_u64());
            }
        }
        w.finish()
    }

    fn decode_payload(kind: RecordKind, payload: &[u8]) -> Result<Self> {
        let mut r = buf::Reader::new(payload);
        let body = match kind {
            RecordKind::Begin => RecordBody::Begin {
                parent: TxnId(r.u64()?),
                flags: r.u8()?,
            },
            RecordKind::Commit => RecordBody::Commit {
                parent: TxnId(r.u64()?),
            },
            RecordKind::Abort => RecordBody::Abort,
            RecordKind::Put => RecordBody::Put {
                table: TableId(r.u32()?),
                key: r.blob()?,
                before: r.opt_blob()?,
                after: r.blob()?,
            },
            RecordKind::Delete => RecordBody::Delete {
                table: TableId(r.u32()?),
                key: r.blob()?,
                before: r.opt_blob()?,
            },
            RecordKind::Update => RecordBody::Update {
                table: TableId(r.u32()?),
                key: r.blob()?,
                extra: r.blob()?,
                before: r.opt_blob()?,
                after: r.opt_blob()?,
            },
            RecordKind::UpdateBroadcast => {
                let table = TableId(r.u32()?);
                let extra = r.blob()?;
                let resetting = r.u8()? != 0;
                let count = r.u32()? as usize;
                let mut entries = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    entries.push(BroadcastEntry {
                        key: r.blob()?,
                        old: r.blob()?,
                        new: r.opt_blob()?,
                    });
                }
                RecordBody::UpdateBroadcast {
                    table,
                    extra,
                    resetting,
                    entries,
                }
            }
            RecordKind::CheckpointBegin => RecordBody::CheckpointBegin {
                prev_end: Lsn::from_u64(r.u64()?),
            },
            RecordKind::CheckpointEnd => {
                let begin = Lsn::from_u64(r.u64()?);
                let prev_end = Lsn::from_u64(r.u64()?);
                let count = r.u32()? as usize;
                let mut active = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    active.push(ActiveTxn {
                        txn: TxnId(r.u64()?),
                        parent: TxnId(r.u64()?),
                        first_lsn: Lsn::from_u64(r.u64()?),
                    });
                }
                RecordBody::CheckpointEnd {
                    begin,
                    prev_end,
                    active,
                }
            }
            RecordKind::Compensate => RecordBody::Compensate {
                undone: Lsn::from_u64(r.u64()?),
            },
        };
        if r.remaining() != 0 {
            return Err(TesseraError::corrupt(format!(
                "{} payload has {} trailing bytes",
                kind.name(),
                r.remaining()
            )));
        }
        Ok(body)
    }
}

/// A log record as appended by callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    /// Owning transaction or [`TxnId::NONE`].
    pub txn: TxnId,
    /// Previous record of the same transaction, zero for the first.
    pub prev_lsn: Lsn,
    /// Typed payload.
    pub body: RecordBody,
}

impl LogRecord {
    /// Record not tied to any transaction.
    pub fn standalone(body: RecordBody) -> Self {
        Self {
            txn: TxnId::NONE,
            prev_lsn: Lsn::ZERO,
            body,
        }
    }

    /// Record appended to `txn`'s chain after `prev_lsn`.
    pub fn chained(txn: TxnId, prev_lsn: Lsn, body: RecordBody) -> Self {
        Self {
            txn,
            prev_lsn,
            body,
        }
    }

    /// Tag of the body.
    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }

    /// Serializes the full frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.body.encode_payload();
        let total = MIN_RECORD_LEN + payload.len();
        if total > MAX_RECORD_LEN {
            return Err(TesseraError::bad_argument(format!(
                "log record of {total} bytes exceeds the {MAX_RECORD_LEN} byte limit"
            )));
        }
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.push(self.kind() as u8);
        out.extend_from_slice(&self.txn.0.to_le_bytes());
        out.extend_from_slice(&self.prev_lsn.to_u64().to_le_bytes());
        out.extend_from_slice(&payload);
        let crc = record_crc32(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    /// Parses a full frame, verifying length and checksum.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < MIN_RECORD_LEN {
            return Err(TesseraError::corrupt("log record shorter than framing"));
        }
        let total = le::get_u32(&frame[0..4]) as usize;
        if total != frame.len() {
            return Err(TesseraError::corrupt(format!(
                "log record length {total} does not match frame of {} bytes",
                frame.len()
            )));
        }
        let crc_at = total - RECORD_TRAILER_LEN;
        let stored = le::get_u32(&frame[crc_at..]);
        if record_crc32(&frame[..crc_at]) != stored {
            return Err(TesseraError::corrupt("log record checksum mismatch"));
        }
        let kind = RecordKind::try_from(frame[4])?;
        let txn = TxnId(le::get_u64(&frame[5..13]));
        let prev_lsn = Lsn::from_u64(le::get_u64(&frame[13..21]));
        let body = RecordBody::decode_payload(kind, &frame[RECORD_HEADER_LEN..crc_at])?;
        Ok(Self {
            txn,
            prev_lsn,
            body,
        })
    }

    /// Reads the length prefix of a frame.
    pub fn frame_len(prefix: &[u8]) -> Result<usize> {
        let len = le::get_u32(prefix) as usize;
        if !(MIN_RECORD_LEN..=MAX_RECORD_LEN).contains(&len) {
            return Err(TesseraError::corrupt(format!(
                "implausible log record length {len}"
            )));
        }
        Ok(len)
    }
}
