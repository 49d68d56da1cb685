//! Restart recovery.
//!
//! 1. Scan the whole log once for the most recent `CHECKPOINT_END` and the
//!    highest transaction id.
//! 2. Discover the start checkpoint and scan from its `BEGIN` (or from the
//!    first record of any transaction it lists as active), grouping records
//!    per transaction.
//! 3. Fold committed children into their parents; drop aborted families and
//!    families with no outcome.
//! 4. Replay committed families in commit-LSN order. A row whose newest
//!    on-disk image is at least as new as the family's commit is skipped, so
//!    replay is idempotent.
//! 5. Close unfinished transactions with `ABORT` records and install the
//!    replayed rows under a fresh checkpoint.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::checkpoint::{self, CheckpointInfo};
use super::store::StoreInner;
use super::table::{Table, Write};
use crate::primitives::wal::{LogRecord, RecordBody};
use crate::types::{ErrorKind, Lsn, Result, TableId, TesseraError, TxnId};

/// What recovery found and did when a store was opened.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RecoveryReport {
    /// Most recent `CHECKPOINT_END` found in the log.
    pub last_checkpoint: Option<Lsn>,
    /// First LSN scanned.
    pub scan_start: Lsn,
    /// Records read from `scan_start` on.
    pub records_scanned: u64,
    /// Top-level transactions replayed.
    pub committed: usize,
    /// Transactions that had already aborted.
    pub aborted: usize,
    /// Transactions with no outcome, now closed with `ABORT`.
    pub unfinished: usize,
    /// Rows written to pages by replay.
    pub rows_replayed: usize,
    /// Duplicate on-disk images released.
    pub stale_released: usize,
    /// Checkpoint taken to install the replayed rows.
    pub checkpoint: Option<CheckpointInfo>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum Outcome {
    #[default]
    Open,
    Committed(Lsn),
    Aborted,
}

#[derive(Default)]
struct TxnLog {
    parent: TxnId,
    records: Vec<(Lsn, RecordBody)>,
    outcome: Outcome,
    last_lsn: Lsn,
}

type RowKey = (TableId, Vec<u8>);

fn scan_error(store: &StoreInner, err: TesseraError) -> TesseraError {
    if err.kind() == ErrorKind::Corrupt {
        store.panic.trip(format!("log corrupt during recovery: {err}"))
    } else {
        err
    }
}

fn gather(id: TxnId, logs: &mut BTreeMap<TxnId, TxnLog>, children: &BTreeMap<TxnId, Vec<TxnId>>, out: &mut Vec<(Lsn, RecordBody)>) {
    if let Some(log) = logs.remove(&id) {
        out.extend(log.records);
    }
    for child in children.get(&id).into_iter().flatten() {
        gather(*child, logs, children, out);
    }
}

/// Rows of `table` live at this point of replay: the on-disk state,
/// overridden by rows already replayed and by the family's own writes.
fn live_rows(
    table: &Table,
    replayed: Option<&BTreeMap<Vec<u8>, (Lsn, Option<Vec<u8>>)>>,
    view: &BTreeMap<RowKey, Option<Vec<u8>>>,
) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut rows: BTreeMap<Vec<u8>, Vec<u8>> = table
        .index
        .read()
        .iter()
        .filter_map(|(key, chain)| {
            chain
                .latest()
                .and_then(|v| v.value.clone())
                .map(|value| (key.clone(), value))
        })
        .collect();
    let overrides = replayed
        .into_iter()
        .flatten()
        .map(|(key, (_, value))| (key, value))
        .chain(
            view.range((table.id, Vec::new())..)
                .take_while(|((t, _), _)| *t == table.id)
                .map(|((_, key), value)| (key, value)),
        );
    for (key, value) in overrides {
        match value {
            Some(value) => rows.insert(key.clone(), value.clone()),
            None => rows.remove(key),
        };
    }
    rows
}

pub(crate) fn recover(store: &StoreInner) -> Result<RecoveryReport> {
    let wal = &store.wal;
    let mut last_end = Lsn::ZERO;
    let mut max_txn = 0u64;
    for item in wal.scan_from(Lsn::ZERO)? {
        let (lsn, record) = item.map_err(|err| scan_error(store, err))?;
        max_txn = max_txn.max(record.txn.0);
        if let RecordBody::CheckpointEnd { active, .. } = &record.body {
            last_end = lsn;
            max_txn = active.iter().map(|a| a.txn.0).fold(max_txn, u64::max);
        }
    }
    store.checkpoints.lock().last_end = last_end;

    let discovery = checkpoint::discover(wal, last_end)?;
    let scan_start = discovery.scan_from();
    let mut report = RecoveryReport {
        last_checkpoint: (!last_end.is_zero()).then_some(last_end),
        scan_start,
        ..RecoveryReport::default()
    };

    let mut logs: BTreeMap<TxnId, TxnLog> = BTreeMap::new();
    for item in wal.scan_from(scan_start)? {
        let (lsn, LogRecord { txn, body, .. }) = item.map_err(|err| scan_error(store, err))?;
        report.records_scanned += 1;
        if txn.is_none() {
            continue;
        }
        let log = logs.entry(txn).or_default();
        log.last_lsn = lsn;
        match body {
            RecordBody::Begin { parent, .. } => log.parent = parent,
            RecordBody::Commit { parent } => {
                log.parent = parent;
                log.outcome = Outcome::Committed(lsn);
            }
            RecordBody::Abort => log.outcome = Outcome::Aborted,
            RecordBody::Compensate { .. }
            | RecordBody::CheckpointBegin { .. }
            | RecordBody::CheckpointEnd { .. } => {}
            body => log.records.push((lsn, body)),
        }
    }

    let unfinished: Vec<(TxnId, Lsn)> = logs
        .iter()
        .filter(|(_, log)| log.outcome == Outcome::Open)
        .map(|(id, log)| (*id, log.last_lsn))
        .collect();
    report.unfinished = unfinished.len();
    report.aborted = logs
        .values()
        .filter(|log| log.outcome == Outcome::Aborted)
        .count();

    let mut children: BTreeMap<TxnId, Vec<TxnId>> = BTreeMap::new();
    let mut roots = Vec::new();
    for (id, log) in &logs {
        if let Outcome::Committed(lsn) = log.outcome {
            if log.parent.is_none() {
                roots.push((lsn, *id));
            } else {
                children.entry(log.parent).or_default().push(*id);
            }
        }
    }
    roots.sort_unstable();
    report.committed = roots.len();

    let callback = store.update.read().clone();
    let mut replayed: BTreeMap<TableId, BTreeMap<Vec<u8>, (Lsn, Option<Vec<u8>>)>> = BTreeMap::new();
    for (commit, root) in roots {
        let mut records = Vec::new();
        gather(root, &mut logs, &children, &mut records);
        records.sort_by_key(|(lsn, _)| *lsn);
        let mut view: BTreeMap<RowKey, Option<Vec<u8>>> = BTreeMap::new();
        for (_, body) in records {
            match body {
                RecordBody::Put { table, key, after, .. } => {
                    view.insert((table, key), Some(after));
                }
                RecordBody::Delete { table, key, .. } => {
                    view.insert((table, key), None);
                }
                RecordBody::Update { table, key, after, .. } => {
                    view.insert((table, key), after);
                }
                RecordBody::UpdateBroadcast {
                    table,
                    resetting: false,
                    entries,
                    ..
                } => {
                    for entry in entries {
                        view.insert((table, entry.key), entry.new);
                    }
                }
                RecordBody::UpdateBroadcast {
                    table,
                    extra,
                    resetting: true,
                    ..
                } => {
                    let callback = callback.as_ref().ok_or_else(|| {
                        TesseraError::bad_argument(
                            "the log holds a resetting broadcast; register the update callback before opening",
                        )
                    })?;
                    let target = store.table(table)?;
                    for (key, old) in live_rows(&target, replayed.get(&table), &view) {
                        let new = callback.call(&key, Some(&old), &extra)?;
                        view.insert((table, key), new);
                    }
                }
                _ => {}
            }
        }
        for ((table, key), value) in view {
            replayed.entry(table).or_default().insert(key, (commit, value));
        }
    }

    let mut staged: Vec<(Arc<Table>, Vec<Write>)> = Vec::new();
    let mut newest = Lsn::ZERO;
    for table in store.tables() {
        newest = newest.max(table.newest_commit());
        let writes: Vec<Write> = replayed
            .remove(&table.id)
            .unwrap_or_default()
            .into_iter()
            .filter(|(key, (commit, _))| table.latest_commit(key) < *commit)
            .map(|(key, (commit, value))| Write { key, value, commit })
            .collect();
        newest = writes.iter().map(|w| w.commit).fold(newest, Lsn::max);
        report.rows_replayed += writes.len();
        report.stale_released += table.stale_count();
        staged.push((table, writes));
    }
    if let Some(table) = replayed.keys().next() {
        return Err(TesseraError::corrupt(format!(
            "log references unknown table {table}"
        )));
    }
    store.snapshots.advance(newest);

    if store.options.readonly {
        for (table, writes) in &staged {
            let horizon = store.snapshots.horizon();
            Table::apply_index(&mut table.index.write(), writes, &HashMap::new(), horizon);
        }
    } else if report.rows_replayed > 0 || report.stale_released > 0 || !unfinished.is_empty() {
        for (txn, last_lsn) in &unfinished {
            wal.append(&LogRecord::chained(*txn, *last_lsn, RecordBody::Abort))?;
        }
        let info = store.checkpoint_with(|begin| {
            for (table, writes) in &staged {
                if writes.is_empty() && table.stale_count() == 0 {
                    continue;
                }
                let placed = table.install_pages(begin, writes)?;
                let horizon = store.snapshots.horizon();
                Table::apply_index(&mut table.index.write(), writes, &placed, horizon);
            }
            Ok(())
        })?;
        report.checkpoint = Some(info);
    }
    store.txns.write().next_id = max_txn + 1;

    info!(
        scan_start = %report.scan_start,
        records = report.records_scanned,
        committed = report.committed,
        aborted = report.aborted,
        unfinished = report.unfinished,
        replayed = report.rows_replayed,
        "recovery.done"
    );
    Ok(report)
}
