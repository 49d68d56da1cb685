use std::path::Path;

use serde::Serialize;

use crate::db::RecoveryReport;
use crate::types::{Lsn, TableId};

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_store;
use crate::admin::Result;

/// Summary printed by `open`.
#[derive(Debug, Clone, Serialize)]
pub struct OpenReport {
    /// Store directory.
    pub dir: String,
    /// Tables as `(id, name)`.
    pub tables: Vec<(TableId, String)>,
    /// Oldest retained log record.
    pub first_lsn: Lsn,
    /// Position the next record would receive.
    pub next_lsn: Lsn,
    /// Log files retained.
    pub log_files: usize,
    /// What recovery did while opening.
    pub recovery: RecoveryReport,
}

/// Opens (creating it when allowed) the store, then closes it cleanly.
pub fn open(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<OpenReport> {
    let path = path.as_ref();
    let store = open_store(path, opts, false)?;
    let wal = store.stats().wal;
    let report = OpenReport {
        dir: path.display().to_string(),
        tables: store.tables(),
        first_lsn: wal.first_lsn,
        next_lsn: wal.next_lsn,
        log_files: wal.files,
        recovery: store.recovery_report(),
    };
    store.close()?;
    Ok(report)
}

/// Runs recovery and reports what it did.
pub fn recover(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<RecoveryReport> {
    let store = open_store(path.as_ref(), opts, false)?;
    let report = store.recovery_report();
    store.close()?;
    Ok(report)
}
