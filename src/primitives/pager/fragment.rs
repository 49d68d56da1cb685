//! Slotted layout packing variable-length fragments into one page body.
//!
//! ```text
//! [free u16][top u16][first-free u16][slot-count u16][slot 0][slot 1]... -> free <- ...[payload]
//! ```
//!
//! Slot `i` is `(offset u16, length u16, flags u16)`. A free slot reuses its
//! offset field as the index of the next free slot.

use crate::primitives::bytes::le;
use crate::types::{PageId, Result, TesseraError};

/// Bytes of the fixed fragment header.
pub const FRAGMENT_HEADER_LEN: usize = 8;
/// Bytes per directory slot.
pub const SLOT_LEN: usize = 6;
/// Sentinel slot index: "no slot".
pub const NONE: u16 = 0xFFFF;

const FREE_BYTES: usize = 0;
const TOP_OF_HEAP: usize = 2;
const FIRST_FREE: usize = 4;
const SLOT_COUNT: usize = 6;

const SLOT_FREE: u16 = 0x0001;

/// Address of one fragment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentId {
    /// Page holding the fragment.
    pub page: PageId,
    /// Directory slot inside the page.
    pub slot: u16,
}

/// Fragment view over a page body. Mutating methods need a mutable body.
#[derive(Debug)]
pub struct FragmentPage<B> {
    body: B,
}

impl<B: AsRef<[u8]>> FragmentPage<B> {
    /// Wraps an already formatted body.
    pub fn open(body: B) -> Result<Self> {
        let page = Self { body };
        let len = page.body.as_ref().len();
        if len < FRAGMENT_HEADER_LEN || len > NONE as usize {
            return Err(TesseraError::corrupt(format!(
                "fragment page body of {len} bytes"
            )));
        }
        if page.top() as usize > len || page.directory_end() > page.top() as usize {
            return Err(TesseraError::corrupt("fragment directory overlaps payload"));
        }
        Ok(page)
    }

    fn get(&self, at: usize) -> u16 {
        le::get_u16(&self.body.as_ref()[at..at + 2])
    }

    fn len(&self) -> usize {
        self.body.as_ref().len()
    }

    /// Bookkeeping counter of free bytes, including holes.
    pub fn free_bytes(&self) -> usize {
        self.get(FREE_BYTES) as usize
    }

    fn top(&self) -> u16 {
        self.get(TOP_OF_HEAP)
    }

    fn first_free(&self) -> u16 {
        self.get(FIRST_FREE)
    }

    /// Directory slots ever issued, free or live.
    pub fn slot_count(&self) -> u16 {
        self.get(SLOT_COUNT)
    }

    fn directory_end(&self) -> usize {
        FRAGMENT_HEADER_LEN + self.slot_count() as usize * SLOT_LEN
    }

    /// Free bytes between the directory and the payload.
    pub fn contiguous_free(&self) -> usize {
        (self.top() as usize).saturating_sub(self.directory_end())
    }

    fn slot(&self, slot: u16) -> (u16, u16, u16) {
        let at = FRAGMENT_HEADER_LEN + slot as usize * SLOT_LEN;
        (self.get(at), self.get(at + 2), self.get(at + 4))
    }

    /// Bytes of a live fragment.
    pub fn read(&self, slot: u16) -> Result<&[u8]> {
        if slot >= self.slot_count() {
            return Err(TesseraError::bad_argument(format!("slot {slot} out of range")));
        }
        let (offset, len, flags) = self.slot(slot);
        if flags & SLOT_FREE != 0 {
            return Err(TesseraError::bad_argument(format!("slot {slot} is free")));
        }
        let (start, end) = (offset as usize, offset as usize + len as usize);
        if start < self.directory_end() || end > self.len() {
            return Err(TesseraError::corrupt(format!(
                "slot {slot} points outside the payload region"
            )));
        }
        Ok(&self.body.as_ref()[start..end])
    }

    /// Live fragments in slot order.
    pub fn live(&self) -> impl Iterator<Item = (u16, &[u8])> + '_ {
        (0..self.slot_count()).filter_map(move |slot| self.read(slot).ok().map(|b| (slot, b)))
    }

    /// True when no slot holds a fragment.
    pub fn is_empty(&self) -> bool {
        (0..self.slot_count()).all(|slot| self.slot(slot).2 & SLOT_FREE != 0)
    }

    /// Largest fragment `alloc` could place, possibly after compaction.
    pub fn max_alloc(&self) -> usize {
        if self.first_free() != NONE {
            self.free_bytes()
        } else {
            self.free_bytes().saturating_sub(SLOT_LEN)
        }
    }

    /// Walks the free list and recomputes the free-byte equation.
    pub fn verify(&self) -> Result<()> {
        let count = self.slot_count();
        let mut seen = 0u16;
        let mut cursor = self.first_free();
        while cursor != NONE {
            if cursor >= count || seen > count {
                return Err(TesseraError::corrupt("fragment free list is malformed"));
            }
            let (next, _, flags) = self.slot(cursor);
            if flags & SLOT_FREE == 0 {
                return Err(TesseraError::corrupt(format!(
                    "free list reaches live slot {cursor}"
                )));
            }
            seen += 1;
            cursor = next;
        }
        let mut live_bytes = 0usize;
        let mut free_slots = 0u16;
        for slot in 0..count {
            let (_, len, flags) = self.slot(slot);
            if flags & SLOT_FREE != 0 {
                free_slots += 1;
            } else {
                self.read(slot)?;
                live_bytes += len as usize;
            }
        }
        if free_slots != seen {
            return Err(TesseraError::corrupt(format!(
                "{free_slots} free slots but {seen} on the free list"
            )));
        }
        let expected = self.len() - self.directory_end() - live_bytes;
        if expected != self.free_bytes() {
            return Err(TesseraError::corrupt(format!(
                "free-byte counter {} disagrees with layout {expected}",
                self.free_bytes()
            )));
        }
        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> FragmentPage<B> {
    /// Formats `body` as an empty fragment page.
    pub fn format(mut body: B) -> Result<Self> {
        let len = body.as_ref().len();
        if len < FRAGMENT_HEADER_LEN || len > NONE as usize {
            return Err(TesseraError::bad_argument(format!(
                "cannot format a {len} byte fragment page"
            )));
        }
        let bytes = body.as_mut();
        bytes.fill(0);
        le::put_u16(&mut bytes[FREE_BYTES..], (len - FRAGMENT_HEADER_LEN) as u16);
        le::put_u16(&mut bytes[TOP_OF_HEAP..], len as u16);
        le::put_u16(&mut bytes[FIRST_FREE..], NONE);
        le::put_u16(&mut bytes[SLOT_COUNT..], 0);
        Ok(Self { body })
    }

    fn put(&mut self, at: usize, value: u16) {
        le::put_u16(&mut self.body.as_mut()[at..at + 2], value);
    }

    fn set_slot(&mut self, slot: u16, offset: u16, len: u16, flags: u16) {
        let at = FRAGMENT_HEADER_LEN + slot as usize * SLOT_LEN;
        self.put(at, offset);
        self.put(at + 2, len);
        self.put(at + 4, flags);
    }

    /// Places `bytes` in the page, returning the slot or [`NONE`] when it
    /// cannot fit even after compaction.
    pub fn alloc(&mut self, bytes: &[u8]) -> u16 {
        let len = bytes.len();
        if len == 0 || len > self.max_alloc() {
            return NONE;
        }
        if let Some(slot) = self.try_place(bytes) {
            return slot;
        }
        self.compact();
        self.try_place(bytes).unwrap_or(NONE)
    }

    fn try_place(&mut self, bytes: &[u8]) -> Option<u16> {
        let len = bytes.len();
        let reuse = self.first_free();
        let slot = if reuse != NONE && self.contiguous_free() >= len {
            let (next, _, _) = self.slot(reuse);
            self.put(FIRST_FREE, next);
            self.put(FREE_BYTES, (self.free_bytes() - len) as u16);
            reuse
        } else if self.contiguous_free() >= len + SLOT_LEN {
            let slot = self.slot_count();
            if slot == NONE {
                return None;
            }
            self.put(SLOT_COUNT, slot + 1);
            self.put(FREE_BYTES, (self.free_bytes() - len - SLOT_LEN) as u16);
            slot
        } else {
            return None;
        };
        let offset = self.top() as usize - len;
        self.body.as_mut()[offset..offset + len].copy_from_slice(bytes);
        self.put(TOP_OF_HEAP, offset as u16);
        self.set_slot(slot, offset as u16, len as u16, 0);
        Some(slot)
    }

    /// Releases a live slot onto the free list. The directory never shrinks.
    pub fn free(&mut self, slot: u16) -> Result<usize> {
        let len = self.read(slot)?.len();
        let head = self.first_free();
        self.set_slot(slot, head, 0, SLOT_FREE);
        self.put(FIRST_FREE, slot);
        self.put(FREE_BYTES, (self.free_bytes() + len) as u16);
        if self.is_empty() {
            // Nothing live: the whole payload region is reusable at once.
            let end = self.len() as u16;
            self.put(TOP_OF_HEAP, end);
        }
        Ok(len)
    }

    /// Repacks live fragments against the end of the page. Longer fragments
    /// go first; equal lengths keep ascending slot order. Slot indexes are
    /// unchanged.
    pub fn compact(&mut self) {
        let mut live: Vec<(u16, Vec<u8>)> = self
            .live()
            .map(|(slot, bytes)| (slot, bytes.to_vec()))
            .collect();
        live.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));
        let mut top = self.len();
        for (slot, bytes) in &live {
            top -= bytes.len();
            self.body.as_mut()[top..top + bytes.len()].copy_from_slice(bytes);
            self.set_slot(*slot, top as u16, bytes.len() as u16, 0);
        }
        let directory_end = self.directory_end();
        self.body.as_mut()[directory_end..top].fill(0);
        self.put(TOP_OF_HEAP, top as u16);
    }

    /// Consumes the view, returning the body.
    pub fn into_inner(self) -> B {
        self.body
    }
}
