#![forbid(unsafe_code)]

//! Store administration and maintenance utilities.
//!
//! Each operation opens a store directory (running recovery), does one job,
//! closes the store cleanly, and returns a `Serialize` report the CLI
//! renders as text or JSON.

mod checkpoint;
mod dump;
mod error;
mod open;
mod options;
mod stats;
mod util;
mod verify;

/// Checkpoint and log archival.
pub use checkpoint::{archive, checkpoint, CheckpointReport};

/// Log and page dumps with hex-encoded keys and values.
pub use dump::{dump_log, dump_pages, LogDump, LogEntry, PageDump, PageEntry};

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Opening a store and reporting recovery.
pub use open::{open, recover, OpenReport};

/// Configuration options for opening a store in admin mode.
pub use options::AdminOpenOptions;

/// Statistics collection and reporting.
pub use stats::{stats, FilesystemStats, StatsReport};

/// Store integrity verification.
pub use verify::{verify, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity};

/// Opens a store the way every admin command does.
pub use util::open_store;
