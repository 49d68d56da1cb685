use std::collections::BTreeMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::checkpoint::{ArchiveReport, CheckpointInfo, CheckpointState, Checkpointer};
use super::commit::Sequencer;
use super::config::{StoreOptions, UpdateCallback};
use super::mvcc::SnapshotRegistry;
use super::recovery::{self, RecoveryReport};
use super::table::{PageRow, Table, TableStats, TableVerify, MAIN_TABLE, TABLE_FILE_EXT};
use super::transaction::{BeginFlags, Transaction, TxnInfo, TxnTable};
use crate::primitives::concurrency::{FairRwLock, LockManager, PanicState, StoreLock};
use crate::primitives::io::{IoProvider, StdIoProvider};
use crate::primitives::pager::{PageStore, WalGate};
use crate::primitives::wal::{LogScanner, Wal, WalStats, LOG_DIR};
use crate::types::{Lsn, PageId, Result, TableId, TesseraError};

const MAX_TABLE_NAME_LEN: usize = 64;

/// Store-wide counters.
#[derive(Clone, Debug, Serialize)]
pub struct StoreStats {
    /// Log counters.
    pub wal: WalStats,
    /// Per-table counters, in id order.
    pub tables: Vec<TableStats>,
    /// Transactions in the transaction table.
    pub active_transactions: usize,
    /// Lock resources with holders or waiters.
    pub locked_resources: usize,
    /// Newest installed commit.
    pub installed: Lsn,
    /// Checkpoints completed since open.
    pub checkpoints: u64,
    /// Most recent checkpoint since open.
    pub last_checkpoint: Option<CheckpointInfo>,
    /// Whether the store has panicked.
    pub panicked: bool,
}

#[derive(Default)]
pub(crate) struct Catalog {
    by_id: BTreeMap<TableId, Arc<Table>>,
    by_name: BTreeMap<String, TableId>,
}

impl Catalog {
    fn insert(&mut self, table: Arc<Table>) {
        self.by_name.insert(table.name.clone(), table.id);
        self.by_id.insert(table.id, table);
    }
}

/// State shared by the store handle, its transactions, and the background
/// checkpointer.
pub(crate) struct StoreInner {
    pub dir: PathBuf,
    pub options: StoreOptions,
    pub provider: Arc<dyn IoProvider>,
    pub panic: Arc<PanicState>,
    pub wal: Arc<Wal>,
    pub catalog: RwLock<Catalog>,
    pub txns: FairRwLock<TxnTable>,
    pub locks: LockManager,
    pub sequencer: Sequencer,
    pub snapshots: Arc<SnapshotRegistry>,
    pub update: RwLock<Option<UpdateCallback>>,
    pub checkpoints: Mutex<CheckpointState>,
    pub recovery: Mutex<RecoveryReport>,
    _lock: StoreLock,
}

impl StoreInner {
    pub fn table(&self, id: TableId) -> Result<Arc<Table>> {
        self.catalog
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| TesseraError::bad_argument(format!("unknown table {id}")))
    }

    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.catalog.read().by_id.values().cloned().collect()
    }

    pub fn update_callback(&self) -> Result<UpdateCallback> {
        self.update
            .read()
            .clone()
            .ok_or_else(|| TesseraError::bad_argument("no update callback registered"))
    }
}

fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_TABLE_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if !valid {
        return Err(TesseraError::bad_argument(format!(
            "invalid table name {name:?}: use 1..={MAX_TABLE_NAME_LEN} ASCII letters, digits, '_' or '-'"
        )));
    }
    Ok(())
}

/// Table files in `dir`, sorted by name.
fn table_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(TABLE_FILE_EXT) {
            continue;
        }
        if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
            found.push((name.to_string(), path.clone()));
        }
    }
    found.sort();
    Ok(found)
}

/// An open store directory.
///
/// Opening runs recovery; [`Store::close`] takes a final checkpoint.
/// Dropping the handle without closing leaves the directory exactly as a
/// crash would.
pub struct Store {
    inner: Arc<StoreInner>,
    checkpointer: Option<Checkpointer>,
}

impl Store {
    /// Opens (or creates) the store in `dir`.
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        Self::open_with_io(dir, options, Arc::new(StdIoProvider))
    }

    /// Opens the store with every data and log file going through
    /// `provider`.
    pub fn open_with_io(
        dir: impl AsRef<Path>,
        options: StoreOptions,
        provider: Arc<dyn IoProvider>,
    ) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            if options.readonly || !options.create_if_missing {
                return Err(TesseraError::bad_argument(format!(
                    "store {} does not exist",
                    dir.display()
                )));
            }
            fs::create_dir_all(&dir)?;
        }
        let lock = StoreLock::acquire(&dir)?;
        let panic = PanicState::new();
        let wal = Arc::new(Wal::open(
            dir.join(LOG_DIR),
            Arc::clone(&provider),
            options.wal_options(),
            Arc::clone(&panic),
        )?);
        let gate: Arc<dyn WalGate> = wal.clone();

        let mut catalog = Catalog::default();
        for (name, path) in table_files(&dir)? {
            let meta = PageStore::read_meta(&path, provider.as_ref())?;
            if meta.name != name {
                return Err(TesseraError::corrupt(format!(
                    "{} holds table {:?}",
                    path.display(),
                    meta.name
                )));
            }
            if let Some(other) = catalog.by_id.get(&meta.table) {
                return Err(TesseraError::corrupt(format!(
                    "tables {:?} and {name:?} share id {}",
                    other.name, meta.table
                )));
            }
            let table = Table::open(
                &dir,
                meta.table,
                &name,
                provider.as_ref(),
                options.pager_options(),
                Arc::clone(&gate),
                Arc::clone(&panic),
            )?;
            catalog.insert(Arc::new(table));
        }
        if !catalog.by_name.contains_key(MAIN_TABLE) {
            if options.readonly {
                return Err(TesseraError::bad_argument(format!(
                    "{} is not a store",
                    dir.display()
                )));
            }
            if catalog.by_id.contains_key(&TableId::MAIN) {
                return Err(TesseraError::corrupt("table id 0 is taken by another table"));
            }
            let table = Table::open(
                &dir,
                TableId::MAIN,
                MAIN_TABLE,
                provider.as_ref(),
                options.pager_options(),
                Arc::clone(&gate),
                Arc::clone(&panic),
            )?;
            catalog.insert(Arc::new(table));
        }

        let inner = Arc::new(StoreInner {
            update: RwLock::new(options.update_callback.clone()),
            dir,
            provider,
            panic,
            wal,
            catalog: RwLock::new(catalog),
            txns: FairRwLock::new(TxnTable::default()),
            locks: LockManager::new(),
            sequencer: Sequencer::default(),
            snapshots: SnapshotRegistry::new(),
            checkpoints: Mutex::new(CheckpointState::default()),
            recovery: Mutex::new(RecoveryReport::default()),
            _lock: lock,
            options,
        });
        let report = recovery::recover(&inner)?;
        *inner.recovery.lock() = report;

        let checkpointer = if inner.options.checkpoint_interval > 0 && !inner.options.readonly {
            Some(Checkpointer::spawn(
                Arc::downgrade(&inner),
                Duration::from_secs(inner.options.checkpoint_interval),
            )?)
        } else {
            None
        };
        info!(
            dir = %inner.dir.display(),
            tables = inner.catalog.read().by_id.len(),
            readonly = inner.options.readonly,
            "store.open"
        );
        Ok(Self {
            inner,
            checkpointer,
        })
    }

    /// Starts a top-level transaction.
    pub fn begin(&self, flags: BeginFlags) -> Result<Transaction> {
        self.begin_nested(None, flags)
    }

    /// Starts a transaction nested in `parent`, or a top-level one.
    pub fn begin_nested(&self, parent: Option<&Transaction>, flags: BeginFlags) -> Result<Transaction> {
        match parent {
            Some(parent) => parent.begin_child(flags),
            None => {
                let core = self.inner.begin_core(None, flags)?;
                Ok(Transaction {
                    store: Arc::clone(&self.inner),
                    core,
                })
            }
        }
    }

    /// Creates an empty table. Creation is not transactional: the table
    /// file is durable when this returns.
    pub fn create_table(&self, name: &str) -> Result<TableId> {
        self.inner.panic.check()?;
        if self.inner.options.readonly {
            return Err(TesseraError::ReadOnly("store opened read-only"));
        }
        validate_table_name(name)?;
        let mut catalog = self.inner.catalog.write();
        if catalog.by_name.contains_key(name) {
            return Err(TesseraError::AlreadyExists);
        }
        let id = catalog
            .by_id
            .keys()
            .next_back()
            .map_or(TableId::MAIN, |last| TableId(last.0 + 1));
        let table = Table::open(
            &self.inner.dir,
            id,
            name,
            self.inner.provider.as_ref(),
            self.inner.options.pager_options(),
            self.inner.wal.clone(),
            Arc::clone(&self.inner.panic),
        )?;
        catalog.insert(Arc::new(table));
        info!(table = name, id = id.0, "store.create_table");
        Ok(id)
    }

    /// Id of the table called `name`.
    pub fn table_id(&self, name: &str) -> Result<TableId> {
        self.inner
            .catalog
            .read()
            .by_name
            .get(name)
            .copied()
            .ok_or(TesseraError::NotFound)
    }

    /// Every table as `(id, name)`, in id order.
    pub fn tables(&self) -> Vec<(TableId, String)> {
        self.inner
            .tables()
            .iter()
            .map(|table| (table.id, table.name.clone()))
            .collect()
    }

    /// Runs a checkpoint now.
    pub fn checkpoint(&self) -> Result<CheckpointInfo> {
        self.inner.checkpoint()
    }

    /// Removes log files recovery can no longer need, or lists them when
    /// `dry_run` is set.
    pub fn archive(&self, dry_run: bool) -> Result<ArchiveReport> {
        self.inner.archive(dry_run)
    }

    /// Checks every data page of every table against its checksum and
    /// fragment bookkeeping.
    pub fn verify(&self) -> Vec<(String, TableVerify)> {
        self.inner
            .tables()
            .iter()
            .map(|table| (table.name.clone(), table.verify()))
            .collect()
    }

    /// Iterates log records from `from` (clamped to the oldest retained
    /// record) to the end of the log.
    pub fn scan_log(&self, from: Lsn) -> Result<LogScanner> {
        self.inner.wal.scan_from(from.max(self.inner.wal.first_lsn()))
    }

    /// Page numbers of the data pages of `table`.
    pub fn data_pages(&self, table: TableId) -> Result<Range<u64>> {
        Ok(self.inner.table(table)?.pages.data_pages())
    }

    /// Live records of one data page of `table`, read from the file and
    /// checksum-verified.
    pub fn page_rows(&self, table: TableId, page: PageId) -> Result<Vec<PageRow>> {
        self.inner.table(table)?.page_rows(page)
    }

    /// Current counters.
    pub fn stats(&self) -> StoreStats {
        let (checkpoints, last_checkpoint) = {
            let state = self.inner.checkpoints.lock();
            (state.completed, state.last.clone())
        };
        StoreStats {
            wal: self.inner.wal.stats(),
            tables: self.inner.tables().iter().map(|t| t.stats()).collect(),
            active_transactions: self.inner.txns.read().live.len(),
            locked_resources: self.inner.locks.active_resources(),
            installed: self.inner.snapshots.installed(),
            checkpoints,
            last_checkpoint,
            panicked: self.inner.panic.is_tripped(),
        }
    }

    /// Transactions currently in the transaction table.
    pub fn active_transactions(&self) -> Vec<TxnInfo> {
        self.inner
            .txns
            .read()
            .live
            .values()
            .map(|core| core.info())
            .collect()
    }

    /// Replaces the update callback used by `update`, broadcasts, and
    /// recovery.
    pub fn set_update_callback(&self, callback: UpdateCallback) {
        *self.inner.update.write() = Some(callback);
    }

    /// What recovery did when the store was opened.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.inner.recovery.lock().clone()
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Whether a fatal failure has made the handle unusable.
    pub fn is_panicked(&self) -> bool {
        self.inner.panic.is_tripped()
    }

    /// Stops the background checkpointer, takes a final checkpoint, and
    /// closes every table file.
    pub fn close(mut self) -> Result<()> {
        if let Some(mut checkpointer) = self.checkpointer.take() {
            checkpointer.shutdown();
        }
        let inner = &self.inner;
        let open = inner.txns.read().live.len();
        if open > 0 {
            warn!(transactions = open, "store.close_with_active");
        }
        if !inner.options.readonly && !inner.panic.is_tripped() {
            inner.checkpoint()?;
        }
        for table in inner.tables() {
            table.pages.close()?;
        }
        debug!(dir = %inner.dir.display(), "store.close");
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.inner.dir)
            .field("readonly", &self.inner.options.readonly)
            .finish()
    }
}
