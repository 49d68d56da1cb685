use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::broadcast::{self, BroadcastSummary};
use super::commit::ChangeSet;
use super::cursor::Cursor;
use super::mvcc::SnapshotGuard;
use super::store::StoreInner;
use super::table::Table;
use crate::primitives::concurrency::{LockMode, LockTarget};
use crate::primitives::wal::{ActiveTxn, LogRecord, RecordBody, RecordKind};
use crate::types::{Lsn, Result, TableId, TesseraError, TxnId};

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr;)* }) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
        pub struct $name(u8);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($bit);)*

            /// No flags.
            pub const fn empty() -> Self {
                $name(0)
            }

            /// Raw bits.
            pub const fn bits(self) -> u8 {
                self.0
            }

            /// True when every flag in `other` is set.
            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

flag_set! {
    /// Options for [`Store::begin`](super::Store::begin).
    BeginFlags {
        /// Read from the state installed when the transaction began.
        SNAPSHOT = 0x01;
        /// Reject every mutation; nothing is logged.
        READ_ONLY = 0x02;
    }
}

flag_set! {
    /// Options for [`Transaction::commit_with`].
    CommitFlags {
        /// Return without waiting for the commit record to be durable.
        NO_SYNC = 0x01;
    }
}

flag_set! {
    /// Options for [`Transaction::put_with`].
    PutFlags {
        /// Fail with `AlreadyExists` when the key is visible.
        NO_OVERWRITE = 0x01;
    }
}

/// Lifecycle of a transaction.
///
/// `Active` moves to `Committing` then `Committed`, or to `Aborting` then
/// `Aborted`. A commit whose log write fails ends `Aborted`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnState {
    /// Accepting reads and writes.
    Active,
    /// Commit record appended; waiting for durability and install.
    Committing,
    /// Effects are visible.
    Committed,
    /// Compensation in progress.
    Aborting,
    /// Effects discarded.
    Aborted,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnState::Active => "active",
            TxnState::Committing => "committing",
            TxnState::Committed => "committed",
            TxnState::Aborting => "aborting",
            TxnState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Row of [`Store::active_transactions`](super::Store::active_transactions).
#[derive(Clone, Debug, Serialize)]
pub struct TxnInfo {
    /// Transaction id.
    pub id: TxnId,
    /// Enclosing transaction, if nested.
    pub parent: Option<TxnId>,
    /// LSN of the `BEGIN` record; zero for read-only transactions.
    pub first_lsn: Lsn,
    /// Current state.
    pub state: TxnState,
    /// Snapshot timestamp, if reading from a snapshot.
    pub snapshot: Option<Lsn>,
}

pub(crate) type Overlay = BTreeMap<TableId, BTreeMap<Vec<u8>, Option<Vec<u8>>>>;

pub(crate) struct TxnInner {
    pub state: TxnState,
    pub last_lsn: Lsn,
    pub overlay: Overlay,
    /// Tails of committed children's chains, for undo.
    pub merged: Vec<Lsn>,
    pub child: Option<TxnId>,
    snapshot: Option<SnapshotGuard>,
}

/// Shared state of one transaction, reachable from its handle, its
/// children, its cursors, and the transaction table.
pub(crate) struct TxnCore {
    pub id: TxnId,
    pub parent: Option<Arc<TxnCore>>,
    pub root: TxnId,
    pub flags: BeginFlags,
    pub first_lsn: Lsn,
    snapshot_ts: Option<Lsn>,
    cancel: AtomicBool,
    lock_timeout_ms: AtomicU64,
    pub inner: Mutex<TxnInner>,
}

impl TxnCore {
    pub fn read_ts(&self) -> Option<Lsn> {
        self.snapshot_ts
            .or_else(|| self.parent.as_ref().and_then(|p| p.read_ts()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    pub fn check_cancel(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(TesseraError::Cancelled);
        }
        Ok(())
    }

    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    pub fn logged(&self) -> bool {
        !self.first_lsn.is_zero()
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms.load(Ordering::Relaxed))
    }

    /// Uncommitted image of `key` as seen from this transaction: its own
    /// writes first, then each ancestor's.
    pub fn lookup(&self, table: TableId, key: &[u8]) -> Option<Option<Vec<u8>>> {
        let mut current = Some(self);
        while let Some(core) = current {
            let found = core
                .inner
                .lock()
                .overlay
                .get(&table)
                .and_then(|rows| rows.get(key).cloned());
            if found.is_some() {
                return found;
            }
            current = core.parent.as_deref();
        }
        None
    }

    /// Uncommitted rows of `table` visible here, descendants overriding
    /// ancestors.
    pub fn merged_overlay(&self, table: TableId) -> BTreeMap<Vec<u8>, Option<Vec<u8>>> {
        let mut merged = match &self.parent {
            Some(parent) => parent.merged_overlay(table),
            None => BTreeMap::new(),
        };
        if let Some(rows) = self.inner.lock().overlay.get(&table) {
            merged.extend(rows.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }

    pub fn info(&self) -> TxnInfo {
        TxnInfo {
            id: self.id,
            parent: self.parent.as_ref().map(|p| p.id),
            first_lsn: self.first_lsn,
            state: self.state(),
            snapshot: self.read_ts(),
        }
    }
}

/// Live transactions, guarded by the fair reader/writer lock. Checkpoints
/// take it exclusively to snapshot the active set.
#[derive(Default)]
pub(crate) struct TxnTable {
    pub live: BTreeMap<TxnId, Arc<TxnCore>>,
    pub next_id: u64,
}

impl TxnTable {
    pub fn allocate_id(&mut self) -> TxnId {
        self.next_id = self.next_id.max(1);
        let id = TxnId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Logged transactions, as recorded in a checkpoint.
    pub fn active(&self) -> Vec<ActiveTxn> {
        self.live
            .values()
            .filter(|core| core.logged())
            .map(|core| ActiveTxn {
                txn: core.id,
                parent: core.parent.as_ref().map_or(TxnId::NONE, |p| p.id),
                first_lsn: core.first_lsn,
            })
            .collect()
    }

    pub fn oldest_first_lsn(&self) -> Option<Lsn> {
        self.live
            .values()
            .filter(|core| core.logged())
            .map(|core| core.first_lsn)
            .min()
    }
}

impl StoreInner {
    pub(crate) fn begin_core(
        self: &Arc<Self>,
        parent: Option<&Arc<TxnCore>>,
        flags: BeginFlags,
    ) -> Result<Arc<TxnCore>> {
        self.panic.check()?;
        let mut flags = flags;
        if self.options.readonly {
            flags = flags | BeginFlags::READ_ONLY;
        }
        if let Some(parent) = parent {
            if parent.flags.contains(BeginFlags::READ_ONLY) {
                flags = flags | BeginFlags::READ_ONLY;
            }
            let inner = parent.inner.lock();
            if inner.state != TxnState::Active {
                return Err(TesseraError::bad_argument(format!(
                    "parent {} is {}",
                    parent.id, inner.state
                )));
            }
            if let Some(child) = inner.child {
                return Err(TesseraError::bad_argument(format!(
                    "parent {} already has active child {child}",
                    parent.id
                )));
            }
        }
        let snapshot = flags
            .contains(BeginFlags::SNAPSHOT)
            .then(|| self.snapshots.hold());
        let mut table = self.txns.write();
        let id = table.allocate_id();
        let parent_id = parent.map_or(TxnId::NONE, |p| p.id);
        let first_lsn = if flags.contains(BeginFlags::READ_ONLY) {
            Lsn::ZERO
        } else {
            self.wal.append(&LogRecord::chained(
                id,
                Lsn::ZERO,
                RecordBody::Begin {
                    parent: parent_id,
                    flags: flags.bits(),
                },
            ))?
        };
        let core = Arc::new(TxnCore {
            id,
            parent: parent.cloned(),
            root: parent.map_or(id, |p| p.root),
            flags,
            first_lsn,
            snapshot_ts: snapshot.as_ref().map(SnapshotGuard::ts),
            cancel: AtomicBool::new(false),
            lock_timeout_ms: AtomicU64::new(
                parent.map_or(self.options.lock_timeout_ms, |p| {
                    p.lock_timeout_ms.load(Ordering::Relaxed)
                }),
            ),
            inner: Mutex::new(TxnInner {
                state: TxnState::Active,
                last_lsn: first_lsn,
                overlay: Overlay::new(),
                merged: Vec::new(),
                child: None,
                snapshot,
            }),
        });
        table.live.insert(id, Arc::clone(&core));
        drop(table);
        if let Some(parent) = parent {
            parent.inner.lock().child = Some(id);
        }
        debug!(txn = id.0, parent = parent_id.0, flags = flags.bits(), lsn = %first_lsn, "txn.begin");
        Ok(core)
    }

    /// Removes a finished transaction and, for a root, drops its locks.
    fn retire(&self, core: &TxnCore, state: TxnState) {
        {
            let mut inner = core.inner.lock();
            inner.state = state;
            inner.overlay.clear();
            inner.snapshot = None;
        }
        if let Some(parent) = &core.parent {
            let mut parent = parent.inner.lock();
            if parent.child == Some(core.id) {
                parent.child = None;
            }
        }
        if core.parent.is_none() {
            self.locks.release_all(core.id);
        }
        self.txns.write().live.remove(&core.id);
    }

    pub(crate) fn commit_core(&self, core: &TxnCore, flags: CommitFlags) -> Result<()> {
        let (changes, last_lsn, merged) = {
            let mut inner = core.inner.lock();
            if inner.state != TxnState::Active {
                return Err(TesseraError::bad_argument(format!(
                    "cannot commit {} while {}",
                    core.id, inner.state
                )));
            }
            if let Some(child) = inner.child {
                return Err(TesseraError::bad_argument(format!(
                    "cannot commit {} while child {child} is active",
                    core.id
                )));
            }
            inner.state = TxnState::Committing;
            (
                std::mem::take(&mut inner.overlay),
                inner.last_lsn,
                std::mem::take(&mut inner.merged),
            )
        };
        if !core.logged() {
            self.retire(core, TxnState::Committed);
            return Ok(());
        }
        match &core.parent {
            Some(parent) => self.commit_child(core, parent, changes, last_lsn, merged),
            None => self.commit_top(core, changes, last_lsn, flags),
        }
    }

    fn commit_child(
        &self,
        core: &TxnCore,
        parent: &TxnCore,
        changes: Overlay,
        last_lsn: Lsn,
        merged: Vec<Lsn>,
    ) -> Result<()> {
        let record = LogRecord::chained(core.id, last_lsn, RecordBody::Commit { parent: parent.id });
        let lsn = match self.wal.append(&record) {
            Ok(lsn) => lsn,
            Err(err) => {
                self.retire(core, TxnState::Aborted);
                return Err(err);
            }
        };
        {
            let mut inner = parent.inner.lock();
            for (table, rows) in changes {
                inner.overlay.entry(table).or_default().extend(rows);
            }
            inner.merged.extend(merged);
            inner.merged.push(lsn);
        }
        self.retire(core, TxnState::Committed);
        debug!(txn = core.id.0, parent = parent.id.0, lsn = %lsn, "txn.commit.child");
        Ok(())
    }

    fn commit_top(
        &self,
        core: &TxnCore,
        changes: Overlay,
        last_lsn: Lsn,
        flags: CommitFlags,
    ) -> Result<()> {
        let changes: ChangeSet = changes.into_iter().filter(|(_, rows)| !rows.is_empty()).collect();
        let record = LogRecord::chained(core.id, last_lsn, RecordBody::Commit { parent: TxnId::NONE });
        let lsn = match self.sequencer.reserve(|| self.wal.append(&record)) {
            Ok(lsn) => lsn,
            Err(err) => {
                self.retire(core, TxnState::Aborted);
                return Err(err);
            }
        };
        let sync = self.options.sync_on_commit && !flags.contains(CommitFlags::NO_SYNC);
        if sync {
            if let Err(err) = self.wal.fsync_through(lsn) {
                self.sequencer.finish(lsn);
                self.retire(core, TxnState::Aborted);
                return Err(err);
            }
        }
        self.sequencer.wait_turn(lsn);
        let installed = if changes.is_empty() {
            Ok(())
        } else {
            self.install(lsn, &changes)
        };
        self.sequencer.finish(lsn);
        if let Err(err) = installed {
            self.retire(core, TxnState::Aborted);
            return Err(err);
        }
        self.retire(core, TxnState::Committed);
        debug!(txn = core.id.0, lsn = %lsn, tables = changes.len(), sync, "txn.commit");
        Ok(())
    }

    pub(crate) fn abort_core(&self, core: &TxnCore) -> Result<()> {
        let child = {
            let inner = core.inner.lock();
            if matches!(inner.state, TxnState::Committed | TxnState::Aborted) {
                return Ok(());
            }
            if inner.state != TxnState::Active {
                return Err(TesseraError::bad_argument(format!(
                    "cannot abort {} while {}",
                    core.id, inner.state
                )));
            }
            inner.child
        };
        if let Some(child) = child {
            let child = self.txns.read().live.get(&child).cloned();
            if let Some(child) = child {
                self.abort_core(&child)?;
            }
        }
        let (last_lsn, merged) = {
            let mut inner = core.inner.lock();
            inner.state = TxnState::Aborting;
            (inner.last_lsn, std::mem::take(&mut inner.merged))
        };
        let result = if core.logged() {
            self.compensate(core, last_lsn, &merged)
        } else {
            Ok(0)
        };
        self.retire(core, TxnState::Aborted);
        let undone = result?;
        debug!(txn = core.id.0, undone, "txn.abort");
        Ok(())
    }

    /// Emits one compensation record per undoable record of `core` and of
    /// the children merged into it, newest first, then the `ABORT` record.
    fn compensate(&self, core: &TxnCore, last_lsn: Lsn, merged: &[Lsn]) -> Result<usize> {
        let mut undo = Vec::new();
        for tail in std::iter::once(last_lsn).chain(merged.iter().copied()) {
            let mut cursor = tail;
            while !cursor.is_zero() {
                let record = self.wal.read(cursor)?;
                if matches!(
                    record.kind(),
                    RecordKind::Put
                        | RecordKind::Delete
                        | RecordKind::Update
                        | RecordKind::UpdateBroadcast
                ) {
                    undo.push(cursor);
                }
                cursor = record.prev_lsn;
            }
        }
        undo.sort_unstable_by(|a, b| b.cmp(a));
        undo.dedup();
        let mut prev = last_lsn;
        for undone in &undo {
            prev = self.wal.append(&LogRecord::chained(
                core.id,
                prev,
                RecordBody::Compensate { undone: *undone },
            ))?;
        }
        self.wal
            .append(&LogRecord::chained(core.id, prev, RecordBody::Abort))?;
        Ok(undo.len())
    }
}

/// Handle on an active transaction.
///
/// Dropping a handle that was neither committed nor aborted aborts it.
pub struct Transaction {
    pub(crate) store: Arc<StoreInner>,
    pub(crate) core: Arc<TxnCore>,
}

impl Transaction {
    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.core.id
    }

    /// Enclosing transaction, if nested.
    pub fn parent(&self) -> Option<TxnId> {
        self.core.parent.as_ref().map(|p| p.id)
    }

    /// Current state.
    pub fn state(&self) -> TxnState {
        self.core.state()
    }

    /// Flags the transaction began with, including inherited ones.
    pub fn flags(&self) -> BeginFlags {
        self.core.flags
    }

    /// Snapshot timestamp reads are served from, if any.
    pub fn snapshot(&self) -> Option<Lsn> {
        self.core.read_ts()
    }

    /// Requests cancellation of long operations running in this transaction
    /// or its descendants. Safe to call from another thread.
    pub fn cancel(&self) {
        self.core.cancel.store(true, Ordering::Release);
    }

    /// Whether this transaction or an ancestor was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    /// Overrides the lock wait for subsequent operations.
    pub fn set_lock_timeout(&self, timeout: Duration) {
        self.core
            .lock_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Starts a nested transaction. The parent may not be used until the
    /// child commits or aborts.
    pub fn begin_child(&self, flags: BeginFlags) -> Result<Transaction> {
        let core = self.store.begin_core(Some(&self.core), flags)?;
        Ok(Transaction {
            store: Arc::clone(&self.store),
            core,
        })
    }

    /// Reads `key` from the main table.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.get_in(TableId::MAIN, key)
    }

    /// Reads `key` from `table`. Fails with `NotFound` when absent.
    pub fn get_in(&self, table: TableId, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_usable()?;
        let table = self.store.table(table)?;
        self.visible(&table, key).ok_or(TesseraError::NotFound)
    }

    /// Inserts or overwrites `key` in the main table.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(TableId::MAIN, key, value, PutFlags::empty())
    }

    /// Inserts or overwrites `key` in `table`.
    pub fn put_in(&self, table: TableId, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(table, key, value, PutFlags::empty())
    }

    /// Writes `key` in `table` with explicit flags.
    ///
    /// Takes the row lock (and the table lock shared) on behalf of the root
    /// transaction, logs a `PUT`, and records the value privately until the
    /// family commits.
    pub fn put_with(&self, table: TableId, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        self.ensure_writable()?;
        let table = self.store.table(table)?;
        table.check_row(key, value)?;
        self.lock_row(table.id, key)?;
        let before = self.visible(&table, key);
        if flags.contains(PutFlags::NO_OVERWRITE) && before.is_some() {
            return Err(TesseraError::AlreadyExists);
        }
        self.log_write(
            table.id,
            key,
            Some(value.to_vec()),
            RecordBody::Put {
                table: table.id,
                key: key.to_vec(),
                before,
                after: value.to_vec(),
            },
        )
    }

    /// Deletes `key` from the main table.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.del_in(TableId::MAIN, key)
    }

    /// Deletes `key` from `table`. Fails with `NotFound` when absent.
    pub fn del_in(&self, table: TableId, key: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let table = self.store.table(table)?;
        self.lock_row(table.id, key)?;
        let before = self.visible(&table, key).ok_or(TesseraError::NotFound)?;
        self.log_write(
            table.id,
            key,
            None,
            RecordBody::Delete {
                table: table.id,
                key: key.to_vec(),
                before: Some(before),
            },
        )
    }

    /// Runs the update callback on `key` of the main table.
    pub fn update(&self, key: &[u8], extra: &[u8]) -> Result<()> {
        self.update_in(TableId::MAIN, key, extra)
    }

    /// Replaces the value of `key` with `callback(key, old, extra)`. A
    /// `None` result deletes the row; a missing row is passed as `None`.
    pub fn update_in(&self, table: TableId, key: &[u8], extra: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let callback = self.store.update_callback()?;
        let table = self.store.table(table)?;
        self.lock_row(table.id, key)?;
        let before = self.visible(&table, key);
        let after = callback.call(key, before.as_deref(), extra)?;
        if before.is_none() && after.is_none() {
            return Ok(());
        }
        if let Some(value) = &after {
            table.check_row(key, value)?;
        }
        self.log_write(
            table.id,
            key,
            after.clone(),
            RecordBody::Update {
                table: table.id,
                key: key.to_vec(),
                extra: extra.to_vec(),
                before,
                after,
            },
        )
    }

    /// Applies the update callback to every row of the main table.
    pub fn update_broadcast(&self, extra: &[u8], resetting: bool) -> Result<BroadcastSummary> {
        self.update_broadcast_in(TableId::MAIN, extra, resetting)
    }

    /// Applies the update callback to every row of `table` visible to this
    /// transaction, as one atomic unit.
    ///
    /// The work runs in an implicit child transaction holding the table lock
    /// exclusively. If the callback fails or the transaction is cancelled,
    /// the child aborts and this transaction is left as it was.
    pub fn update_broadcast_in(
        &self,
        table: TableId,
        extra: &[u8],
        resetting: bool,
    ) -> Result<BroadcastSummary> {
        self.ensure_writable()?;
        let callback = self.store.update_callback()?;
        let table = self.store.table(table)?;
        self.store.locks.acquire(
            self.core.root,
            LockTarget::Table(table.id),
            LockMode::Exclusive,
            self.core.lock_timeout(),
        )?;
        let child = self.begin_child(BeginFlags::empty())?;
        match broadcast::run(&child, &table, extra, resetting, &callback) {
            Ok(summary) => {
                child.commit()?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(abort_err) = child.abort() {
                    warn!(txn = self.core.id.0, error = %abort_err, "broadcast.abort_failed");
                }
                Err(err)
            }
        }
    }

    /// Ordered cursor over the main table.
    pub fn cursor(&self) -> Result<Cursor> {
        self.cursor_in(TableId::MAIN)
    }

    /// Ordered cursor over `table` showing this transaction's view: its
    /// snapshot (or the state installed when the cursor opened) plus its own
    /// uncommitted writes as of now.
    pub fn cursor_in(&self, table: TableId) -> Result<Cursor> {
        self.ensure_usable()?;
        let table = self.store.table(table)?;
        let (ts, guard) = match self.core.read_ts() {
            Some(ts) => (ts, None),
            None => {
                let guard = self.store.snapshots.hold();
                (guard.ts(), Some(guard))
            }
        };
        let overlay = self.core.merged_overlay(table.id);
        Ok(Cursor::new(table, Arc::clone(&self.core), ts, guard, overlay))
    }

    /// Commits with the store's default durability.
    pub fn commit(self) -> Result<()> {
        self.commit_with(CommitFlags::empty())
    }

    /// Commits. A child merges its effects into its parent; a top-level
    /// transaction waits for its commit record to be durable (unless
    /// `NO_SYNC`) and then makes its effects visible.
    pub fn commit_with(self, flags: CommitFlags) -> Result<()> {
        self.store.panic.check()?;
        self.store.commit_core(&self.core, flags)
    }

    /// Aborts, first aborting any active child.
    pub fn abort(self) -> Result<()> {
        self.store.abort_core(&self.core)
    }

    /// Value of `key` visible to this transaction.
    pub(crate) fn visible(&self, table: &Table, key: &[u8]) -> Option<Vec<u8>> {
        match self.core.lookup(table.id, key) {
            Some(value) => value,
            None => table.visible(key, self.core.read_ts().unwrap_or(Lsn::MAX)),
        }
    }

    pub(crate) fn log_write(
        &self,
        table: TableId,
        key: &[u8],
        value: Option<Vec<u8>>,
        body: RecordBody,
    ) -> Result<()> {
        let mut inner = self.core.inner.lock();
        let lsn = self
            .store
            .wal
            .append(&LogRecord::chained(self.core.id, inner.last_lsn, body))?;
        inner.last_lsn = lsn;
        inner
            .overlay
            .entry(table)
            .or_default()
            .insert(key.to_vec(), value);
        Ok(())
    }

    /// Logs `body` and applies every row in `rows` under one lock hold.
    pub(crate) fn log_rows(
        &self,
        table: TableId,
        body: Option<RecordBody>,
        rows: impl IntoIterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
    ) -> Result<()> {
        let mut inner = self.core.inner.lock();
        if let Some(body) = body {
            let lsn = self
                .store
                .wal
                .append(&LogRecord::chained(self.core.id, inner.last_lsn, body))?;
            inner.last_lsn = lsn;
        }
        inner.overlay.entry(table).or_default().extend(rows);
        Ok(())
    }

    fn lock_row(&self, table: TableId, key: &[u8]) -> Result<()> {
        let timeout = self.core.lock_timeout();
        let locks = &self.store.locks;
        locks.acquire(self.core.root, LockTarget::Table(table), LockMode::Shared, timeout)?;
        locks.acquire(
            self.core.root,
            LockTarget::Row(table, key.to_vec()),
            LockMode::Exclusive,
            timeout,
        )
    }

    fn ensure_usable(&self) -> Result<()> {
        self.store.panic.check()?;
        let inner = self.core.inner.lock();
        if inner.state != TxnState::Active {
            return Err(TesseraError::bad_argument(format!(
                "transaction {} is {}",
                self.core.id, inner.state
            )));
        }
        if let Some(child) = inner.child {
            return Err(TesseraError::bad_argument(format!(
                "transaction {} has active child {child}",
                self.core.id
            )));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_usable()?;
        if self.store.options.readonly {
            return Err(TesseraError::ReadOnly("store opened read-only"));
        }
        if self.core.flags.contains(BeginFlags::READ_ONLY) {
            return Err(TesseraError::ReadOnly("transaction is read-only"));
        }
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.core.id)
            .field("parent", &self.parent())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.core.state() != TxnState::Active {
            return;
        }
        warn!(txn = self.core.id.0, "txn.dropped_active");
        if let Err(err) = self.store.abort_core(&self.core) {
            warn!(txn = self.core.id.0, error = %err, "txn.drop_abort_failed");
        }
    }
}
