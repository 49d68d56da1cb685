use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use super::mvcc::SnapshotGuard;
use super::table::Table;
use super::transaction::TxnCore;
use crate::types::{Lsn, Result, TableId};

/// Ascending iterator over the rows of one table as seen by a transaction.
///
/// Committed rows come from the version index at a fixed timestamp; the
/// transaction's uncommitted writes captured when the cursor opened are
/// merged on top. Each step re-checks the transaction's cancel flag and
/// yields `Err(Cancelled)` once it is set.
pub struct Cursor {
    table: Arc<Table>,
    core: Arc<TxnCore>,
    ts: Lsn,
    _snapshot: Option<SnapshotGuard>,
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    after: Option<Vec<u8>>,
    done: bool,
}

impl Cursor {
    pub(crate) fn new(
        table: Arc<Table>,
        core: Arc<TxnCore>,
        ts: Lsn,
        snapshot: Option<SnapshotGuard>,
        overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    ) -> Self {
        Self {
            table,
            core,
            ts,
            _snapshot: snapshot,
            overlay,
            after: None,
            done: false,
        }
    }

    /// Table being scanned.
    pub fn table(&self) -> TableId {
        self.table.id
    }

    /// Timestamp committed rows are read at.
    pub fn timestamp(&self) -> Lsn {
        self.ts
    }

    fn lower(&self) -> Bound<&[u8]> {
        match &self.after {
            Some(key) => Bound::Excluded(key.as_slice()),
            None => Bound::Unbounded,
        }
    }

    fn next_committed(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let index = self.table.index.read();
        index
            .range::<[u8], _>((self.lower(), Bound::Unbounded))
            .find_map(|(key, chain)| chain.value_at(self.ts).map(|v| (key.clone(), v.to_vec())))
    }

    fn next_pending(&self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        self.overlay
            .range::<[u8], _>((self.lower(), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn step(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        loop {
            let committed = self.next_committed();
            let pending = self.next_pending();
            let (key, value) = match (committed, pending) {
                (None, None) => return None,
                (Some(row), None) => (row.0, Some(row.1)),
                (None, Some(row)) => row,
                (Some(c), Some(p)) if c.0 < p.0 => (c.0, Some(c.1)),
                (Some(_), Some(p)) => p,
            };
            self.after = Some(key.clone());
            if let Some(value) = value {
                return Some((key, value));
            }
        }
    }
}

impl Iterator for Cursor {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Err(err) = self.core.check_cancel() {
            self.done = true;
            return Some(Err(err));
        }
        match self.step() {
            Some(row) => Some(Ok(row)),
            None => {
                self.done = true;
                None
            }
        }
    }
}
