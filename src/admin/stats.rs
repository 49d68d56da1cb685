use std::path::Path;

use serde::Serialize;

use crate::db::StoreStats;
use crate::primitives::wal::{parse_log_file_name, LOG_DIR};

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::{dir_bytes, open_store};
use crate::admin::Result;

/// Counters of a store plus the size of its files.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Engine counters, as reported by the store after opening.
    pub store: StoreStats,
    /// On-disk footprint.
    pub filesystem: FilesystemStats,
}

/// Sizes of the files in a store directory.
#[derive(Debug, Clone, Serialize)]
pub struct FilesystemStats {
    /// Store directory.
    pub dir: String,
    /// Bytes held by table files.
    pub table_bytes: u64,
    /// Bytes held by log files.
    pub log_bytes: u64,
}

/// Opens the store read-only and reports its counters.
pub fn stats(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<StatsReport> {
    let path = path.as_ref();
    let store = open_store(path, opts, true)?;
    let report = StatsReport {
        store: store.stats(),
        filesystem: FilesystemStats {
            dir: path.display().to_string(),
            table_bytes: dir_bytes(path, |name| name.ends_with(".tbl"))?,
            log_bytes: dir_bytes(&path.join(LOG_DIR), |name| parse_log_file_name(name).is_some())?,
        },
    };
    store.close()?;
    Ok(report)
}
