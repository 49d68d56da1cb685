//! Committed version chains and the snapshot registry.
//!
//! Every key of a table maps to a [`Chain`] of committed versions ordered by
//! commit LSN. A reader with snapshot `ts` sees the newest version whose
//! commit LSN is `<= ts`; a reader without a snapshot sees the newest one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::primitives::pager::FragmentId;
use crate::types::Lsn;

/// One committed image of a key. `None` is a tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Version {
    pub commit: Lsn,
    pub value: Option<Vec<u8>>,
}

/// Committed versions of one key plus where the newest live one sits on disk.
#[derive(Clone, Debug, Default)]
pub(crate) struct Chain {
    versions: Vec<Version>,
    /// Fragment holding the newest version, if it is live.
    pub location: Option<FragmentId>,
}

/// Key to version chain, ordered for range scans.
pub(crate) type KeyIndex = BTreeMap<Vec<u8>, Chain>;

impl Chain {
    pub fn loaded(commit: Lsn, value: Vec<u8>, location: FragmentId) -> Self {
        Self {
            versions: vec![Version {
                commit,
                value: Some(value),
            }],
            location: Some(location),
        }
    }

    /// Newest version visible at `ts`.
    pub fn visible(&self, ts: Lsn) -> Option<&Version> {
        self.versions.iter().rev().find(|v| v.commit <= ts)
    }

    /// Value visible at `ts`, if live.
    pub fn value_at(&self, ts: Lsn) -> Option<&[u8]> {
        self.visible(ts).and_then(|v| v.value.as_deref())
    }

    pub fn latest(&self) -> Option<&Version> {
        self.versions.last()
    }

    pub fn latest_commit(&self) -> Lsn {
        self.latest().map_or(Lsn::ZERO, |v| v.commit)
    }

    pub fn push(&mut self, commit: Lsn, value: Option<Vec<u8>>) {
        debug_assert!(commit >= self.latest_commit());
        if self.latest().is_some_and(|v| v.commit == commit) {
            self.versions.pop();
        }
        self.versions.push(Version { commit, value });
    }

    /// Drops versions no snapshot at or after `horizon` can observe.
    pub fn prune(&mut self, horizon: Lsn) {
        if let Some(keep_from) = self.versions.iter().rposition(|v| v.commit <= horizon) {
            self.versions.drain(..keep_from);
        }
    }

    /// True once only an unobservable tombstone remains.
    pub fn is_dead(&self, horizon: Lsn) -> bool {
        self.location.is_none()
            && match self.versions.as_slice() {
                [] => true,
                [only] => only.value.is_none() && only.commit <= horizon,
                _ => false,
            }
    }

    pub fn versions(&self) -> usize {
        self.versions.len()
    }
}

/// Snapshot timestamps held by open readers, plus the clock they are read
/// from: the LSN of the last commit whose effects were installed.
#[derive(Default)]
pub(crate) struct SnapshotRegistry {
    held: Mutex<BTreeMap<Lsn, usize>>,
    installed: AtomicU64,
}

impl SnapshotRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Last installed commit LSN.
    pub fn installed(&self) -> Lsn {
        Lsn::from_u64(self.installed.load(Ordering::Acquire))
    }

    /// Moves the clock forward to `lsn` once its effects are visible.
    pub fn advance(&self, lsn: Lsn) {
        self.installed.fetch_max(lsn.to_u64(), Ordering::AcqRel);
    }

    /// Registers a reader at the current clock until the guard drops.
    pub fn hold(self: &Arc<Self>) -> SnapshotGuard {
        let mut held = self.held.lock();
        let ts = self.installed();
        *held.entry(ts).or_insert(0) += 1;
        SnapshotGuard {
            registry: Arc::clone(self),
            ts,
        }
    }

    /// Oldest timestamp any current or future reader may still use.
    pub fn horizon(&self) -> Lsn {
        let held = self.held.lock();
        let now = self.installed();
        held.keys().next().map_or(now, |oldest| (*oldest).min(now))
    }

    fn release(&self, ts: Lsn) {
        let mut held = self.held.lock();
        if let Some(count) = held.get_mut(&ts) {
            *count -= 1;
            if *count == 0 {
                held.remove(&ts);
            }
        }
    }
}

/// Keeps one snapshot timestamp registered.
pub(crate) struct SnapshotGuard {
    registry: Arc<SnapshotRegistry>,
    ts: Lsn,
}

impl SnapshotGuard {
    pub fn ts(&self) -> Lsn {
        self.ts
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.registry.release(self.ts);
    }
}
