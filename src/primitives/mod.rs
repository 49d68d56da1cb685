//! Low-level primitives for building the storage engine.
//!
//! Includes byte codecs, positioned file I/O, locking, the write-ahead log,
//! and the page store with its fragment allocator.

/// Byte-level utilities and encoding/decoding.
pub mod bytes;

/// Fair reader/writer locks, the row lock manager, and the store lock.
pub mod concurrency;

/// Positioned file I/O behind a swappable provider.
pub mod io;

/// Page store, superblock, and fragment allocator.
///
/// Manages fixed-size pages of one table file: pinning, write-back ordered by
/// page-LSN, and variable-length fragments inside a page.
pub mod pager;

/// Write-ahead log with group commit.
///
/// Ensures durability through sequential logging of every mutation.
pub mod wal;
