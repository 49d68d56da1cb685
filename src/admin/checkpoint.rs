use std::path::Path;
use std::time::Instant;

use serde::Serialize;

use crate::db::{ArchiveReport, CheckpointInfo};

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_store;
use crate::admin::Result;

/// Report generated after executing a checkpoint operation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    /// Duration of the checkpoint operation in milliseconds.
    pub duration_ms: f64,
    /// The checkpoint that was taken.
    pub checkpoint: CheckpointInfo,
}

/// Executes a checkpoint on a store.
///
/// Opens the store at the given path (running recovery), takes a
/// checkpoint, and closes the store cleanly.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the checkpoint fails.
pub fn checkpoint(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<CheckpointReport> {
    let store = open_store(path.as_ref(), opts, false)?;
    let start = Instant::now();
    let checkpoint = store.checkpoint()?;
    let elapsed = start.elapsed();
    store.close()?;
    Ok(CheckpointReport {
        duration_ms: elapsed.as_secs_f64() * 1_000.0,
        checkpoint,
    })
}

/// Lists (with `dry_run`) or deletes log files recovery no longer needs.
pub fn archive(path: impl AsRef<Path>, opts: &AdminOpenOptions, dry_run: bool) -> Result<ArchiveReport> {
    let store = open_store(path.as_ref(), opts, dry_run)?;
    let report = store.archive(dry_run)?;
    store.close()?;
    Ok(report)
}
