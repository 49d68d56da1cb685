//! Tessera: a transactional paged storage engine.
//!
//! Rows live in named tables backed by fixed-size pages; every change is
//! written ahead to a segmented log with group commit; fuzzy checkpoints
//! bound recovery; transactions nest, can read from snapshots, and can apply
//! a user callback to a whole table as one atomic broadcast update.
//!
//! ```no_run
//! use tessera::{BeginFlags, Store, StoreOptions};
//!
//! # fn main() -> tessera::Result<()> {
//! let store = Store::open("/tmp/tessera-demo", StoreOptions::default())?;
//! let txn = store.begin(BeginFlags::empty())?;
//! txn.put(b"greeting", b"hello")?;
//! txn.commit()?;
//! store.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod admin;
pub mod db;
pub mod primitives;
pub mod types;

pub use db::{
    BeginFlags, CommitFlags, Cursor, PutFlags, Store, StoreOptions, Transaction, TxnState,
    UpdateCallback,
};
pub use types::{ErrorKind, Lsn, Result, TableId, TesseraError, TxnId};
