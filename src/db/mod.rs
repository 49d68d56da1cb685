//! Transactional key/value store built on the page store and the log.
//!
//! A [`Store`] owns a directory holding the log files, one file per table,
//! and a `LOCK` file. Transactions buffer their writes privately, log every
//! change before it happens, and install committed rows onto pages in
//! commit-LSN order. Snapshot transactions read a fixed installed state;
//! everything else reads the newest one.

mod broadcast;
mod checkpoint;
mod commit;
mod config;
mod cursor;
mod mvcc;
mod recovery;
mod store;
mod table;
mod transaction;

pub use broadcast::BroadcastSummary;
pub use checkpoint::{ArchiveReport, CheckpointInfo};
pub use config::{StoreOptions, UpdateCallback, UpdateFn};
pub use cursor::Cursor;
pub use recovery::RecoveryReport;
pub use store::{Store, StoreStats};
pub use table::{PageRow, TableStats, TableVerify, MAIN_TABLE, TABLE_FILE_EXT};
pub use transaction::{BeginFlags, CommitFlags, PutFlags, Transaction, TxnInfo, TxnState};
