//! One logical table: its page file, committed index, free-space map and
//! free-page list.
//!
//! Rows live on data pages as fragments laid out as
//! `[commit-LSN u64][key-len u16][key][value]`. Pages only ever hold the
//! newest committed image of a key; uncommitted writes never reach them.
//! A data page whose last record is deleted is retagged `Free` and joins the
//! free-page list, which is rebuilt from those tags at open and consulted
//! before the file grows.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use super::mvcc::{Chain, KeyIndex};
use crate::primitives::bytes::le;
use crate::primitives::concurrency::PanicState;
use crate::primitives::io::IoProvider;
use crate::primitives::pager::fragment::{FRAGMENT_HEADER_LEN, NONE, SLOT_LEN};
use crate::primitives::pager::{
    FragmentId, FragmentPage, PageHandle, PageStore, PagerOptions, PagerStats, PinMode, WalGate,
};
use crate::types::page::{self, PageKind};
use crate::types::{Lsn, PageId, Result, TableId, TesseraError};

/// File extension of table files.
pub const TABLE_FILE_EXT: &str = "tbl";
/// Name of the table every store starts with.
pub const MAIN_TABLE: &str = "main";

const RECORD_PREFIX_LEN: usize = 8 + 2;

/// One committed change headed for a table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Write {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    /// Commit LSN stored with the record.
    pub commit: Lsn,
}

/// Per-table counters.
#[derive(Clone, Debug, Serialize)]
pub struct TableStats {
    /// Table id.
    pub id: TableId,
    /// Table name.
    pub name: String,
    /// Keys with at least one retained version.
    pub keys: usize,
    /// Emptied pages waiting for reuse.
    pub free_pages: usize,
    /// Page cache counters.
    pub pager: PagerStats,
}

/// One live record as stored on a data page.
#[derive(Clone, Debug, Serialize)]
pub struct PageRow {
    /// Fragment slot.
    pub slot: u16,
    /// Commit LSN stored with the record.
    pub commit: Lsn,
    /// Row key.
    pub key: Vec<u8>,
    /// Row value.
    pub value: Vec<u8>,
}

/// Outcome of checking every page of a table file.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TableVerify {
    /// Data pages examined.
    pub pages: u64,
    /// Pages tagged free.
    pub free_pages: u64,
    /// Live records found.
    pub records: u64,
    /// Human-readable problems; empty when the file is sound.
    pub problems: Vec<String>,
}

pub(crate) fn table_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{TABLE_FILE_EXT}"))
}

pub(crate) fn encode_record(commit: Lsn, key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; RECORD_PREFIX_LEN + key.len() + value.len()];
    le::put_u64(&mut out[0..8], commit.to_u64());
    le::put_u16(&mut out[8..10], key.len() as u16);
    out[RECORD_PREFIX_LEN..RECORD_PREFIX_LEN + key.len()].copy_from_slice(key);
    out[RECORD_PREFIX_LEN + key.len()..].copy_from_slice(value);
    out
}

pub(crate) fn decode_record(bytes: &[u8]) -> Result<(Lsn, &[u8], &[u8])> {
    if bytes.len() < RECORD_PREFIX_LEN {
        return Err(TesseraError::corrupt("record shorter than its prefix"));
    }
    let commit = Lsn::from_u64(le::get_u64(&bytes[0..8]));
    let key_len = le::get_u16(&bytes[8..10]) as usize;
    let rest = &bytes[RECORD_PREFIX_LEN..];
    if key_len > rest.len() {
        return Err(TesseraError::corrupt(format!(
            "record key length {key_len} exceeds record"
        )));
    }
    Ok((commit, &rest[..key_len], &rest[key_len..]))
}

fn is_unformatted(body: &[u8]) -> bool {
    body[..FRAGMENT_HEADER_LEN].iter().all(|b| *b == 0)
}

fn open_body(body: &mut [u8]) -> Result<FragmentPage<&mut [u8]>> {
    if is_unformatted(body) {
        FragmentPage::format(body)
    } else {
        FragmentPage::open(body)
    }
}

pub(crate) struct Table {
    pub id: TableId,
    pub name: String,
    pub pages: PageStore,
    pub index: RwLock<KeyIndex>,
    space: Mutex<BTreeMap<PageId, usize>>,
    free_pages: Mutex<BTreeSet<PageId>>,
    stale: Mutex<Vec<FragmentId>>,
}

#[derive(Default)]
struct PagePlan {
    frees: Vec<u16>,
    adds: Vec<usize>,
}

impl Table {
    /// Opens the table file and rebuilds the committed index from its pages.
    pub fn open(
        dir: &Path,
        id: TableId,
        name: &str,
        provider: &dyn IoProvider,
        options: PagerOptions,
        gate: Arc<dyn WalGate>,
        panic: Arc<PanicState>,
    ) -> Result<Self> {
        let pages = PageStore::open(table_path(dir, name), id, name, provider, options, gate, panic)?;
        let table = Self {
            id,
            name: name.to_string(),
            pages,
            index: RwLock::new(KeyIndex::new()),
            space: Mutex::new(BTreeMap::new()),
            free_pages: Mutex::new(BTreeSet::new()),
            stale: Mutex::new(Vec::new()),
        };
        table.rebuild()?;
        Ok(table)
    }

    fn rebuild(&self) -> Result<()> {
        let mut index = KeyIndex::new();
        let mut space = BTreeMap::new();
        let mut free_pages = BTreeSet::new();
        let mut stale = Vec::new();
        let empty = self.pages.body_len() - FRAGMENT_HEADER_LEN - SLOT_LEN;
        for page in self.pages.data_pages().map(PageId) {
            let handle = self.pages.pin(page, PinMode::Read)?;
            let view = handle.read()?;
            if view.kind()? == PageKind::Free {
                free_pages.insert(page);
                continue;
            }
            if is_unformatted(view.body()) {
                space.insert(page, empty);
                continue;
            }
            let frag = FragmentPage::open(view.body())?;
            frag.verify()
                .map_err(|err| TesseraError::corrupt(format!("table {} page {page}: {err}", self.name)))?;
            for (slot, bytes) in frag.live() {
                let (commit, key, value) = decode_record(bytes)?;
                let here = FragmentId { page, slot };
                match index.get_mut(key) {
                    None => {
                        index.insert(key.to_vec(), Chain::loaded(commit, value.to_vec(), here));
                    }
                    Some(chain) => {
                        if commit > chain.latest_commit() {
                            stale.extend(chain.location);
                            *chain = Chain::loaded(commit, value.to_vec(), here);
                        } else {
                            stale.push(here);
                        }
                    }
                }
            }
            space.insert(page, frag.max_alloc());
        }
        if !stale.is_empty() {
            warn!(table = %self.name, duplicates = stale.len(), "table.stale_records");
        }
        debug!(
            table = %self.name,
            keys = index.len(),
            pages = space.len(),
            free = free_pages.len(),
            "table.rebuild"
        );
        *self.index.write() = index;
        *self.space.lock() = space;
        *self.free_pages.lock() = free_pages;
        *self.stale.lock() = stale;
        Ok(())
    }

    /// Largest value storable under a key of `key_len` bytes.
    pub fn max_value_len(&self, key_len: usize) -> usize {
        (self.pages.body_len() - FRAGMENT_HEADER_LEN - SLOT_LEN)
            .saturating_sub(RECORD_PREFIX_LEN + key_len)
    }

    /// Rejects rows that could never be placed on a page.
    pub fn check_row(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > u16::MAX as usize {
            return Err(TesseraError::bad_argument(format!(
                "key of {} bytes exceeds {}",
                key.len(),
                u16::MAX
            )));
        }
        let max = self.max_value_len(key.len());
        if value.len() > max {
            return Err(TesseraError::bad_argument(format!(
                "value of {} bytes exceeds the {max} bytes a page can hold for this key",
                value.len()
            )));
        }
        Ok(())
    }

    /// Committed value of `key` visible at `ts`.
    pub fn visible(&self, key: &[u8], ts: Lsn) -> Option<Vec<u8>> {
        self.index
            .read()
            .get(key)
            .and_then(|chain| chain.value_at(ts))
            .map(<[u8]>::to_vec)
    }

    /// Newest committed LSN recorded for `key`.
    pub fn latest_commit(&self, key: &[u8]) -> Lsn {
        self.index
            .read()
            .get(key)
            .map_or(Lsn::ZERO, Chain::latest_commit)
    }

    /// Highest commit LSN held by any key.
    pub fn newest_commit(&self) -> Lsn {
        self.index
            .read()
            .values()
            .map(Chain::latest_commit)
            .max()
            .unwrap_or(Lsn::ZERO)
    }

    pub fn keys(&self) -> usize {
        self.index.read().len()
    }

    /// Committed rows visible at `ts`, grouped by the data page holding the
    /// newest image, in ascending page order.
    pub fn rows_by_page(&self, ts: Lsn) -> Vec<(Option<PageId>, Vec<(Vec<u8>, Vec<u8>)>)> {
        let index = self.index.read();
        let mut groups: BTreeMap<Option<PageId>, Vec<(Vec<u8>, Vec<u8>)>> = BTreeMap::new();
        for (key, chain) in index.iter() {
            if let Some(value) = chain.value_at(ts) {
                let page = chain.location.map(|loc| loc.page);
                groups.entry(page).or_default().push((key.clone(), value.to_vec()));
            }
        }
        groups.into_iter().collect()
    }

    /// Writes `writes` onto data pages stamped with `page_lsn`, visiting
    /// pages in ascending order, and returns where each live key now sits.
    /// Stale duplicates found at open are released along the way.
    pub fn install_pages(
        &self,
        page_lsn: Lsn,
        writes: &[Write],
    ) -> Result<HashMap<Vec<u8>, FragmentId>> {
        let mut plan: BTreeMap<PageId, PagePlan> = BTreeMap::new();
        {
            let index = self.index.read();
            for write in writes {
                if let Some(loc) = index.get(&write.key).and_then(|c| c.location) {
                    plan.entry(loc.page).or_default().frees.push(loc.slot);
                }
            }
        }
        for loc in self.stale.lock().drain(..) {
            plan.entry(loc.page).or_default().frees.push(loc.slot);
        }

        let records: Vec<Option<Vec<u8>>> = writes
            .iter()
            .map(|w| w.value.as_ref().map(|v| encode_record(w.commit, &w.key, v)))
            .collect();
        let mut overflow = Vec::new();
        {
            let mut space = self.space.lock();
            for (i, record) in records.iter().enumerate() {
                let Some(record) = record else { continue };
                let need = record.len() + SLOT_LEN;
                match space.iter_mut().find(|(_, free)| **free >= need) {
                    Some((page, free)) => {
                        *free -= need;
                        plan.entry(*page).or_default().adds.push(i);
                    }
                    None => overflow.push(i),
                }
            }
        }

        let mut placed = HashMap::with_capacity(writes.len());
        let mut emptied = Vec::new();
        for (page, work) in plan {
            let handle = self.pages.pin(page, PinMode::Write)?;
            let mut guard = handle.write()?;
            let (free, is_empty) = {
                let mut frag = open_body(guard.body_mut())?;
                for slot in work.frees {
                    frag.free(slot)?;
                }
                for i in work.adds {
                    let Some(record) = &records[i] else { continue };
                    match frag.alloc(record) {
                        NONE => overflow.push(i),
                        slot => {
                            placed.insert(writes[i].key.clone(), FragmentId { page, slot });
                        }
                    }
                }
                (frag.max_alloc(), frag.is_empty())
            };
            if is_empty {
                FragmentPage::format(guard.body_mut())?;
                guard.set_kind(PageKind::Free);
                self.space.lock().remove(&page);
                emptied.push(page);
            } else {
                self.space.lock().insert(page, free);
            }
            guard.mark_dirty(page_lsn)?;
        }

        let mut pending = overflow.into_iter().peekable();
        while pending.peek().is_some() {
            let handle = self.reuse_or_allocate()?;
            let page = handle.id();
            let mut guard = handle.write()?;
            guard.set_kind(PageKind::Data);
            let free = {
                let mut frag = FragmentPage::format(guard.body_mut())?;
                while let Some(&i) = pending.peek() {
                    let Some(record) = &records[i] else {
                        pending.next();
                        continue;
                    };
                    match frag.alloc(record) {
                        NONE if frag.slot_count() == 0 => {
                            return Err(TesseraError::bad_argument(format!(
                                "record of {} bytes does not fit an empty page",
                                record.len()
                            )));
                        }
                        NONE => break,
                        slot => {
                            placed.insert(writes[i].key.clone(), FragmentId { page, slot });
                            pending.next();
                        }
                    }
                }
                frag.max_alloc()
            };
            guard.mark_dirty(page_lsn)?;
            self.space.lock().insert(page, free);
        }
        // Pages emptied by this batch already carry `page_lsn`, so they are
        // only handed out to later batches.
        if !emptied.is_empty() {
            debug!(table = %self.name, pages = ?emptied, "table.pages_emptied");
            self.free_pages.lock().extend(emptied);
        }
        debug!(table = %self.name, lsn = %page_lsn, writes = writes.len(), "table.install");
        Ok(placed)
    }

    /// Write-pins the lowest free page, or a new page when none is free.
    fn reuse_or_allocate(&self) -> Result<PageHandle> {
        let reused = self.free_pages.lock().pop_first();
        match reused {
            Some(page) => self.pages.pin(page, PinMode::Write).map_err(|err| {
                self.free_pages.lock().insert(page);
                err
            }),
            None => self.pages.allocate(PageKind::Data),
        }
    }

    /// Emptied pages waiting for reuse.
    pub fn free_page_count(&self) -> usize {
        self.free_pages.lock().len()
    }

    /// Records `writes` in `index` with the locations returned by
    /// [`Table::install_pages`], pruning versions older than `horizon`.
    pub fn apply_index(
        index: &mut KeyIndex,
        writes: &[Write],
        placed: &HashMap<Vec<u8>, FragmentId>,
        horizon: Lsn,
    ) {
        for write in writes {
            let chain = index.entry(write.key.clone()).or_default();
            chain.push(write.commit, write.value.clone());
            chain.location = placed.get(&write.key).copied();
            chain.prune(horizon);
            if chain.is_dead(horizon) {
                index.remove(&write.key);
            }
        }
    }

    /// Stale duplicates waiting to be released.
    pub fn stale_count(&self) -> usize {
        self.stale.lock().len()
    }

    /// Reads every data page straight from the file and checks checksums,
    /// fragment bookkeeping, and record framing.
    pub fn verify(&self) -> TableVerify {
        let mut report = TableVerify::default();
        for page in self.pages.data_pages().map(PageId) {
            report.pages += 1;
            let image = match self.pages.read_page(page) {
                Ok(image) => image,
                Err(err) => {
                    report.problems.push(format!("page {page}: {err}"));
                    continue;
                }
            };
            let body = &image[image.len() - self.pages.body_len()..];
            if is_unformatted(body) {
                continue;
            }
            if page::page_kind(&image).ok() == Some(PageKind::Free) {
                report.free_pages += 1;
                let emptied = FragmentPage::open(body).map(|frag| frag.is_empty());
                if !matches!(emptied, Ok(true)) {
                    report.problems.push(format!("page {page}: free page still holds records"));
                }
                continue;
            }
            let checked = FragmentPage::open(body).and_then(|frag| {
                frag.verify()?;
                for (_, bytes) in frag.live() {
                    decode_record(bytes)?;
                    report.records += 1;
                }
                Ok(())
            });
            if let Err(err) = checked {
                report.problems.push(format!("page {page}: {err}"));
            }
        }
        report
    }

    /// Live records of one data page, read straight from the file.
    pub fn page_rows(&self, page: PageId) -> Result<Vec<PageRow>> {
        let image = self.pages.read_page(page)?;
        let body = &image[image.len() - self.pages.body_len()..];
        if is_unformatted(body) || page::page_kind(&image)? == PageKind::Free {
            return Ok(Vec::new());
        }
        let frag = FragmentPage::open(body)?;
        frag.live()
            .map(|(slot, bytes)| {
                let (commit, key, value) = decode_record(bytes)?;
                Ok(PageRow {
                    slot,
                    commit,
                    key: key.to_vec(),
                    value: value.to_vec(),
                })
            })
            .collect()
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            id: self.id,
            name: self.name.clone(),
            keys: self.keys(),
            free_pages: self.free_page_count(),
            pager: self.pages.stats(),
        }
    }
}
