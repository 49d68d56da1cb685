//! Commit ordering.
//!
//! Commit records are appended under the sequencer lock, so the set of
//! pending commit LSNs and log order always agree. Each committer then waits
//! for its LSN to become the smallest pending one before installing, which
//! makes installs (and therefore snapshot timestamps) follow log order even
//! though fsyncs complete in batches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::store::StoreInner;
use super::table::{Table, Write};
use crate::types::{Lsn, Result, TableId};

/// Rows a transaction family changed, per table.
pub(crate) type ChangeSet = BTreeMap<TableId, BTreeMap<Vec<u8>, Option<Vec<u8>>>>;

#[derive(Default)]
pub(crate) struct Sequencer {
    pending: Mutex<BTreeSet<Lsn>>,
    turn: Condvar,
}

impl Sequencer {
    /// Runs `append` and registers the LSN it returns as pending.
    pub fn reserve(&self, append: impl FnOnce() -> Result<Lsn>) -> Result<Lsn> {
        let mut pending = self.pending.lock();
        let lsn = append()?;
        pending.insert(lsn);
        Ok(lsn)
    }

    /// Blocks until every commit logged before `lsn` has finished.
    pub fn wait_turn(&self, lsn: Lsn) {
        let mut pending = self.pending.lock();
        while pending.first().is_some_and(|first| *first < lsn) {
            self.turn.wait(&mut pending);
        }
    }

    /// Marks `lsn` installed (or abandoned) and wakes later committers.
    pub fn finish(&self, lsn: Lsn) {
        self.pending.lock().remove(&lsn);
        self.turn.notify_all();
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl StoreInner {
    /// Applies a committed change set to pages and then, atomically across
    /// the touched tables, to the committed index.
    pub(crate) fn install(&self, commit: Lsn, changes: &ChangeSet) -> Result<()> {
        let mut staged: Vec<(Arc<Table>, Vec<Write>, _)> = Vec::with_capacity(changes.len());
        for (table_id, rows) in changes {
            let table = self.table(*table_id)?;
            let writes: Vec<Write> = rows
                .iter()
                .map(|(key, value)| Write {
                    key: key.clone(),
                    value: value.clone(),
                    commit,
                })
                .collect();
            let placed = table.install_pages(commit, &writes).map_err(|err| {
                self.panic
                    .trip(format!("installing commit {commit} into {} failed: {err}", table.name))
            })?;
            staged.push((table, writes, placed));
        }
        let horizon = self.snapshots.horizon();
        {
            let mut indexes: Vec<_> = staged.iter().map(|(table, _, _)| table.index.write()).collect();
            for ((_, writes, placed), index) in staged.iter().zip(indexes.iter_mut()) {
                Table::apply_index(index, writes, placed, horizon);
            }
        }
        self.snapshots.advance(commit);
        debug!(lsn = %commit, tables = staged.len(), "commit.install");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn installs_follow_log_order() {
        let sequencer = Arc::new(Sequencer::default());
        let next = Arc::new(AtomicUsize::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let (sequencer, next, order) = (sequencer.clone(), next.clone(), order.clone());
                thread::spawn(move || {
                    let lsn = sequencer
                        .reserve(|| Ok(Lsn::new(1, next.fetch_add(1, Ordering::SeqCst) as u32)))
                        .unwrap();
                    thread::yield_now();
                    sequencer.wait_turn(lsn);
                    order.lock().push(lsn);
                    sequencer.finish(lsn);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let order = order.lock();
        assert_eq!(order.len(), 16);
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sequencer.pending(), 0);
    }
}
