#![forbid(unsafe_code)]

mod frame;
pub mod fragment;
mod meta;
mod pager;

pub use fragment::{FragmentId, FragmentPage};
pub use meta::{
    validate_page_size, Meta, CATALOG_PAGE, FIRST_DATA_PAGE, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
    SUPERBLOCK_MAGIC, SUPERBLOCK_PAGE,
};
pub use pager::{
    NoWal, PageHandle, PageRead, PageStore, PageWrite, PagerOptions, PagerStats, PinMode, WalGate,
};
