#![forbid(unsafe_code)]

use xxhash_rust::xxh64::Xxh64;

use super::page::header;

/// Seed for every page checksum. Fixed for the lifetime of the format.
const PAGE_SEED: u64 = 0x7465_7373_6572_6131;

pub trait Checksum {
    fn reset(&mut self);
    fn update(&mut self, bytes: &[u8]);
    fn finalize(&self) -> u64;
}

pub struct PageHasher {
    inner: Xxh64,
}

impl Default for PageHasher {
    fn default() -> Self {
        Self {
            inner: Xxh64::new(PAGE_SEED),
        }
    }
}

impl Checksum for PageHasher {
    fn reset(&mut self) {
        self.inner.reset(PAGE_SEED);
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u64 {
        self.inner.digest()
    }
}

/// Checksum of a full page image, skipping the checksum field itself.
pub fn page_checksum(page: &[u8]) -> u64 {
    let mut hasher = PageHasher::default();
    hasher.update(&page[..header::CHECKSUM.start]);
    hasher.update(&[0u8; 8]);
    hasher.update(&page[header::CHECKSUM.end..]);
    hasher.finalize()
}

/// CRC32 over a log record, from its length prefix to the end of its payload.
pub fn record_crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}
