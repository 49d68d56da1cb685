//! Identifiers, error kinds, and the on-disk page header shared by every layer.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Checksum helpers for pages and log records.
pub mod checksum;

/// Dense page number inside one table file.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier, unique per store.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Sentinel carried by log records that belong to no transaction.
    pub const NONE: TxnId = TxnId(0);

    /// Returns true for the "no transaction" sentinel.
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Identifier of a logical table inside a store.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct TableId(pub u32);

impl TableId {
    /// The `main` table every store starts with.
    pub const MAIN: TableId = TableId(0);
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log sequence number: `(file-number, offset)` packed so that the numeric
/// order of the packed form is the lexicographic order of the pair.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// The position before any record.
    pub const ZERO: Lsn = Lsn(0);
    /// Greater than every addressable LSN.
    pub const MAX: Lsn = Lsn(u64::MAX);

    /// Builds an LSN from a log file number and a byte offset inside it.
    pub const fn new(file: u32, offset: u32) -> Self {
        Lsn(((file as u64) << 32) | offset as u64)
    }

    /// Log file number.
    pub const fn file(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Byte offset within the log file.
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }

    /// Packed representation stored on disk.
    pub const fn to_u64(self) -> u64 {
        self.0
    }

    /// Rebuilds an LSN from its packed form.
    pub const fn from_u64(raw: u64) -> Self {
        Lsn(raw)
    }

    /// Returns true for [`Lsn::ZERO`].
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file(), self.offset())
    }
}

impl std::str::FromStr for Lsn {
    type Err = TesseraError;

    /// Parses the `file/offset` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self> {
        let parsed = s
            .split_once('/')
            .and_then(|(file, offset)| Some(Lsn::new(file.parse().ok()?, offset.parse().ok()?)));
        parsed.ok_or_else(|| TesseraError::bad_argument(format!("invalid LSN {s:?}; expected file/offset")))
    }
}

impl Serialize for Lsn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Kind of failure, independent of the concrete error value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Requested key does not exist.
    NotFound,
    /// Key exists under a no-overwrite put.
    AlreadyExists,
    /// Page was never allocated.
    Missing,
    /// Page is pinned for write by someone else.
    Busy,
    /// Checksum mismatch or on-disk structural violation.
    Corrupt,
    /// Device error.
    Io,
    /// Lock wait exceeded its timeout.
    LockTimeout,
    /// Page locks taken out of ascending order.
    LockOrderViolation,
    /// Mutation attempted through a read-only transaction or store.
    ReadOnlyViolation,
    /// A long operation observed its cancel flag.
    Cancelled,
    /// The store handle is unusable until reopened.
    Panicked,
    /// Caller contract violation.
    BadArgument,
}

impl ErrorKind {
    /// Stable snake_case name used in CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Missing => "missing",
            ErrorKind::Busy => "busy",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::Io => "io",
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::LockOrderViolation => "lock_order_violation",
            ErrorKind::ReadOnlyViolation => "read_only_violation",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Panicked => "panicked",
            ErrorKind::BadArgument => "bad_argument",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum TesseraError {
    /// Requested key does not exist.
    #[error("key not found")]
    NotFound,
    /// Key already present under a no-overwrite put.
    #[error("key already exists")]
    AlreadyExists,
    /// Page number beyond the allocated range.
    #[error("page {0} has never been allocated")]
    Missing(PageId),
    /// Another handle holds the write pin.
    #[error("page {0} is pinned for write")]
    Busy(PageId),
    /// Checksum mismatch or structural violation.
    #[error("{0}")]
    Corrupt(String),
    /// Underlying device error.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Lock wait timed out.
    #[error("lock not acquired within {0:?}")]
    LockTimeout(Duration),
    /// Page lock requested below one already held.
    #[error("page {requested} locked after page {held}")]
    LockOrderViolation {
        /// Highest page already locked.
        held: PageId,
        /// Page whose lock was requested.
        requested: PageId,
    },
    /// Mutation through a read-only handle.
    #[error("{0}")]
    ReadOnly(&'static str),
    /// Cancel flag observed.
    #[error("operation cancelled")]
    Cancelled,
    /// Sticky store failure.
    #[error("{0}")]
    Panicked(String),
    /// Caller contract violation.
    #[error("{0}")]
    BadArgument(String),
}

impl TesseraError {
    /// Maps the error onto its kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TesseraError::NotFound => ErrorKind::NotFound,
            TesseraError::AlreadyExists => ErrorKind::AlreadyExists,
            TesseraError::Missing(_) => ErrorKind::Missing,
            TesseraError::Busy(_) => ErrorKind::Busy,
            TesseraError::Corrupt(_) => ErrorKind::Corrupt,
            TesseraError::Io(_) => ErrorKind::Io,
            TesseraError::LockTimeout(_) => ErrorKind::LockTimeout,
            TesseraError::LockOrderViolation { .. } => ErrorKind::LockOrderViolation,
            TesseraError::ReadOnly(_) => ErrorKind::ReadOnlyViolation,
            TesseraError::Cancelled => ErrorKind::Cancelled,
            TesseraError::Panicked(_) => ErrorKind::Panicked,
            TesseraError::BadArgument(_) => ErrorKind::BadArgument,
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        TesseraError::Corrupt(msg.into())
    }

    pub(crate) fn bad_argument(msg: impl Into<String>) -> Self {
        TesseraError::BadArgument(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Page header layout shared by every page kind.
pub mod page {
    use super::{Lsn, PageId, Result, TesseraError};
    use crate::primitives::bytes::le;
    use std::convert::TryFrom;

    /// Magic bytes opening every page.
    pub const PAGE_MAGIC: [u8; 4] = *b"TSPG";
    /// Page format version.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Length of the fixed page header in bytes.
    pub const PAGE_HDR_LEN: usize = 32;

    /// Header flag: body is snappy-compressed on disk.
    pub const FLAG_COMPRESSED: u8 = 0x01;

    /// Byte ranges of the header fields.
    pub mod header {
        use std::ops::Range;

        /// Magic bytes.
        pub const MAGIC: Range<usize> = 0..4;
        /// Format version.
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        /// Page kind tag.
        pub const KIND: usize = 6;
        /// Flag byte.
        pub const FLAGS: usize = 7;
        /// Page number, repeated for torn-write detection.
        pub const PAGE_NO: Range<usize> = 8..16;
        /// LSN of the last modification.
        pub const PAGE_LSN: Range<usize> = 16..24;
        /// 64-bit checksum over the page with this field zeroed.
        pub const CHECKSUM: Range<usize> = 24..32;
    }

    /// Tag identifying how a page body is interpreted.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum PageKind {
        /// Page 0 of every table file.
        Superblock = 1,
        /// Table metadata root.
        Catalog = 2,
        /// Fragment page holding records.
        Data = 3,
        /// Data page whose last record was deleted; reused before the file grows.
        Free = 4,
    }

    impl TryFrom<u8> for PageKind {
        type Error = TesseraError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::Superblock),
                2 => Ok(PageKind::Catalog),
                3 => Ok(PageKind::Data),
                4 => Ok(PageKind::Free),
                other => Err(TesseraError::corrupt(format!("unknown page kind {other}"))),
            }
        }
    }

    /// Decoded page header.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PageHeader {
        /// Body interpretation.
        pub kind: PageKind,
        /// Flag bits.
        pub flags: u8,
        /// Page number.
        pub page_no: PageId,
        /// LSN of the last modification.
        pub page_lsn: Lsn,
        /// Stored checksum.
        pub checksum: u64,
    }

    impl PageHeader {
        /// Header for a freshly formatted page.
        pub fn new(kind: PageKind, page_no: PageId) -> Self {
            Self {
                kind,
                flags: 0,
                page_no,
                page_lsn: Lsn::ZERO,
                checksum: 0,
            }
        }

        /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(TesseraError::bad_argument("page header buffer too small"));
            }
            dst[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            le::put_u16(&mut dst[header::FORMAT_VERSION], PAGE_FORMAT_VERSION);
            dst[header::KIND] = self.kind as u8;
            dst[header::FLAGS] = self.flags;
            le::put_u64(&mut dst[header::PAGE_NO], self.page_no.0);
            le::put_u64(&mut dst[header::PAGE_LSN], self.page_lsn.to_u64());
            le::put_u64(&mut dst[header::CHECKSUM], self.checksum);
            Ok(())
        }

        /// Parses and validates the header at the start of `src`.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(TesseraError::corrupt("page shorter than header"));
            }
            if src[header::MAGIC] != PAGE_MAGIC {
                return Err(TesseraError::corrupt("page magic mismatch"));
            }
            let version = le::get_u16(&src[header::FORMAT_VERSION]);
            if version != PAGE_FORMAT_VERSION {
                return Err(TesseraError::corrupt(format!(
                    "unsupported page format version {version}"
                )));
            }
            Ok(Self {
                kind: PageKind::try_from(src[header::KIND])?,
                flags: src[header::FLAGS],
                page_no: PageId(le::get_u64(&src[header::PAGE_NO])),
                page_lsn: Lsn::from_u64(le::get_u64(&src[header::PAGE_LSN])),
                checksum: le::get_u64(&src[header::CHECKSUM]),
            })
        }
    }

    /// Overwrites only the page-LSN field.
    pub fn set_page_lsn(page: &mut [u8], lsn: Lsn) {
        le::put_u64(&mut page[header::PAGE_LSN], lsn.to_u64());
    }

    /// Reads only the page-LSN field.
    pub fn page_lsn(page: &[u8]) -> Lsn {
        Lsn::from_u64(le::get_u64(&page[header::PAGE_LSN]))
    }

    /// Reads only the kind tag.
    pub fn page_kind(page: &[u8]) -> Result<PageKind> {
        PageKind::try_from(page[header::KIND])
    }

    /// Overwrites only the kind tag.
    pub fn set_page_kind(page: &mut [u8], kind: PageKind) {
        page[header::KIND] = kind as u8;
    }
}
