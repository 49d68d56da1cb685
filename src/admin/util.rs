use std::fs;
use std::path::Path;

use crate::db::{Store, MAIN_TABLE, TABLE_FILE_EXT};

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;

/// Opens the store at `path`, running recovery.
///
/// # Errors
///
/// Returns [`AdminError::MissingStore`] if `path` holds no store and
/// `create_if_missing` is false, or any error from opening the store.
pub fn open_store(path: &Path, opts: &AdminOpenOptions, readonly: bool) -> Result<Store> {
    if !opts.create_if_missing && !is_store(path) {
        return Err(AdminError::missing_store(path));
    }
    Ok(Store::open(path, opts.store_options(readonly))?)
}

pub(crate) fn is_store(path: &Path) -> bool {
    path.join(format!("{MAIN_TABLE}.{TABLE_FILE_EXT}")).is_file()
}

/// Total size in bytes of the files in `dir` accepted by `filter`; zero when
/// `dir` does not exist.
pub(crate) fn dir_bytes(dir: &Path, filter: impl Fn(&str) -> bool) -> Result<u64> {
    let mut total = 0;
    if !dir.is_dir() {
        return Ok(total);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_str().is_some_and(&filter) {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
