use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::pager::{validate_page_size, PagerOptions};
use crate::primitives::wal::{WalOptions, MAX_ROLLOVER_SIZE, MIN_ROLLOVER_SIZE};
use crate::types::{Result, TesseraError};

/// Signature of the user-supplied update function: `(key, old, extra)` to
/// the new value, or `None` to delete the row.
pub type UpdateFn = dyn Fn(&[u8], Option<&[u8]>, &[u8]) -> Result<Option<Vec<u8>>> + Send + Sync;

/// Shareable handle on the update function registered with a store.
#[derive(Clone)]
pub struct UpdateCallback(Arc<UpdateFn>);

impl UpdateCallback {
    /// Wraps `f`.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[u8], Option<&[u8]>, &[u8]) -> Result<Option<Vec<u8>>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, key: &[u8], old: Option<&[u8]>, extra: &[u8]) -> Result<Option<Vec<u8>>> {
        (self.0)(key, old, extra)
    }
}

impl fmt::Debug for UpdateCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UpdateCallback(..)")
    }
}

/// Options recognized when a store is opened.
///
/// Deserializable from TOML; absent keys take their defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreOptions {
    /// Page size for newly created table files (power of two, 4 KiB..=64 KiB).
    pub page_size: u32,
    /// A new log file starts once the current one would exceed this size.
    pub log_rollover_size: u64,
    /// Page cache budget per table, in bytes.
    pub cache_size: usize,
    /// Seconds between background checkpoints; 0 disables them.
    pub checkpoint_interval: u64,
    /// Top-level commits wait for their commit record to be fsynced.
    pub sync_on_commit: bool,
    /// Reject every mutation and never write to the directory.
    pub readonly: bool,
    /// Initialize an empty directory instead of failing.
    pub create_if_missing: bool,
    /// Default wait for row and table locks, in milliseconds.
    pub lock_timeout_ms: u64,
    /// How long the log writer lingers to batch more commits, in milliseconds.
    pub group_commit_max_wait_ms: u64,
    /// Snappy-compress page bodies on disk.
    pub compress_pages: bool,
    /// Function used by `update`, `update_broadcast`, and their replay.
    #[serde(skip)]
    pub update_callback: Option<UpdateCallback>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: 8192,
            log_rollover_size: 16 << 20,
            cache_size: 8 << 20,
            checkpoint_interval: 0,
            sync_on_commit: true,
            readonly: false,
            create_if_missing: true,
            lock_timeout_ms: 5_000,
            group_commit_max_wait_ms: 0,
            compress_pages: false,
            update_callback: None,
        }
    }
}

impl StoreOptions {
    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self = toml::from_str(text)
            .map_err(|err| TesseraError::bad_argument(format!("invalid store options: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Registers the update function.
    pub fn with_update_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8], Option<&[u8]>, &[u8]) -> Result<Option<Vec<u8>>> + Send + Sync + 'static,
    {
        self.update_callback = Some(UpdateCallback::new(f));
        self
    }

    /// Read-only variant of these options.
    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Checks ranges; violations are `BadArgument`.
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if !(MIN_ROLLOVER_SIZE..=MAX_ROLLOVER_SIZE).contains(&self.log_rollover_size) {
            return Err(TesseraError::bad_argument(format!(
                "log_rollover_size must be within {MIN_ROLLOVER_SIZE}..={MAX_ROLLOVER_SIZE}"
            )));
        }
        if self.cache_size < self.page_size as usize {
            return Err(TesseraError::bad_argument(
                "cache_size must hold at least one page",
            ));
        }
        Ok(())
    }

    /// Lock wait as a duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub(crate) fn wal_options(&self) -> WalOptions {
        WalOptions {
            rollover_size: self.log_rollover_size,
            group_commit_wait: Duration::from_millis(self.group_commit_max_wait_ms),
            readonly: self.readonly,
        }
    }

    pub(crate) fn pager_options(&self) -> PagerOptions {
        PagerOptions {
            page_size: self.page_size,
            cache_bytes: self.cache_size,
            compress: self.compress_pages,
            readonly: self.readonly,
        }
    }
}
