use parking_lot::Mutex;

use crate::primitives::concurrency::FairRwLock;
use crate::types::{Lsn, PageId};

#[derive(Debug, Default)]
pub(crate) struct FrameState {
    pub readers: u32,
    pub writer: bool,
    /// LSN at which the page first became dirty since its last write-back.
    pub rec_lsn: Option<Lsn>,
}

impl FrameState {
    pub fn is_pinned(&self) -> bool {
        self.readers > 0 || self.writer
    }
}

/// Cached page image plus its pin bookkeeping.
pub(crate) struct Frame {
    pub id: PageId,
    pub data: FairRwLock<Vec<u8>>,
    pub state: Mutex<FrameState>,
}

impl Frame {
    pub fn new(id: PageId, image: Vec<u8>) -> Self {
        Self {
            id,
            data: FairRwLock::new(image),
            state: Mutex::new(FrameState::default()),
        }
    }

    pub fn evictable(&self) -> bool {
        let state = self.state.lock();
        !state.is_pinned() && state.rec_lsn.is_none()
    }
}
