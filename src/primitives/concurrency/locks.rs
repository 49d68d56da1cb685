//! Table and row locks held by transaction families until they finish.
//!
//! Locks are owned by the root transaction id, so a nested transaction acts
//! as its parent for conflict purposes. Waiters are served first-come
//! first-served per resource; an owner that already holds a resource in
//! shared mode may upgrade once it is the only holder.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::types::{Result, TableId, TesseraError, TxnId};

/// Lock strength.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Compatible with other shared holders.
    Shared,
    /// Excludes every other holder.
    Exclusive,
}

/// Lockable resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LockTarget {
    /// Whole table; broadcasts take it exclusive, ordinary writers shared.
    Table(TableId),
    /// One key inside a table.
    Row(TableId, Vec<u8>),
}

#[derive(Default)]
struct Entry {
    holders: Vec<(TxnId, LockMode)>,
    waiting: VecDeque<(TxnId, LockMode)>,
}

impl Entry {
    fn held_by(&self, owner: TxnId) -> Option<LockMode> {
        self.holders
            .iter()
            .find(|(o, _)| *o == owner)
            .map(|(_, m)| *m)
    }

    fn grantable(&self, owner: TxnId, mode: LockMode) -> bool {
        let compatible = self
            .holders
            .iter()
            .filter(|(o, _)| *o != owner)
            .all(|(_, m)| mode == LockMode::Shared && *m == LockMode::Shared);
        if !compatible {
            return false;
        }
        // Upgrades skip the queue; everyone else waits their turn.
        if self.held_by(owner).is_some() {
            return true;
        }
        match self.waiting.front() {
            None => true,
            Some((front, _)) => *front == owner,
        }
    }

    fn grant(&mut self, owner: TxnId, mode: LockMode) {
        if let Some(slot) = self.holders.iter_mut().find(|(o, _)| *o == owner) {
            if mode == LockMode::Exclusive {
                slot.1 = LockMode::Exclusive;
            }
        } else {
            self.holders.push((owner, mode));
        }
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.waiting.is_empty()
    }
}

#[derive(Default)]
struct LockTable {
    entries: HashMap<LockTarget, Entry>,
    owned: HashMap<TxnId, HashSet<LockTarget>>,
}

/// Lock manager shared by every transaction of a store.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    changed: Condvar,
}

impl LockManager {
    /// Creates an empty lock manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `target` in `mode` for `owner`, waiting at most `timeout`.
    pub fn acquire(
        &self,
        owner: TxnId,
        target: LockTarget,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();
        {
            let entry = table.entries.entry(target.clone()).or_default();
            match entry.held_by(owner) {
                Some(LockMode::Exclusive) => return Ok(()),
                Some(LockMode::Shared) if mode == LockMode::Shared => return Ok(()),
                _ => {}
            }
            if entry.grantable(owner, mode) {
                entry.grant(owner, mode);
                table.owned.entry(owner).or_default().insert(target);
                return Ok(());
            }
            entry.waiting.push_back((owner, mode));
        }
        debug!(owner = owner.0, ?target, ?mode, "locks.wait");
        loop {
            let timed_out = self.changed.wait_until(&mut table, deadline).timed_out();
            let entry = table.entries.entry(target.clone()).or_default();
            if entry.grantable(owner, mode) {
                entry.waiting.retain(|(o, _)| *o != owner);
                entry.grant(owner, mode);
                table.owned.entry(owner).or_default().insert(target);
                self.changed.notify_all();
                return Ok(());
            }
            if timed_out {
                entry.waiting.retain(|(o, _)| *o != owner);
                if entry.is_idle() {
                    table.entries.remove(&target);
                }
                self.changed.notify_all();
                debug!(owner = owner.0, ?target, "locks.timeout");
                return Err(TesseraError::LockTimeout(timeout));
            }
        }
    }

    /// Returns the strongest mode `owner` holds on `target`.
    pub fn holds(&self, owner: TxnId, target: &LockTarget) -> Option<LockMode> {
        self.table
            .lock()
            .entries
            .get(target)
            .and_then(|e| e.held_by(owner))
    }

    /// Releases every lock held by `owner`.
    pub fn release_all(&self, owner: TxnId) {
        let mut table = self.table.lock();
        let Some(targets) = table.owned.remove(&owner) else {
            return;
        };
        for target in targets {
            if let Some(entry) = table.entries.get_mut(&target) {
                entry.holders.retain(|(o, _)| *o != owner);
                if entry.is_idle() {
                    table.entries.remove(&target);
                }
            }
        }
        self.changed.notify_all();
    }

    /// Number of resources with holders or waiters.
    pub fn active_resources(&self) -> usize {
        self.table.lock().entries.len()
    }
}
