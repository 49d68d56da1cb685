use std::fmt;
use std::ops::Range;

use rand::{rngs::OsRng, RngCore};

use crate::primitives::bytes::{buf, le};
use crate::types::{
    page::{PageHeader, PageKind, PAGE_HDR_LEN},
    PageId, Result, TableId, TesseraError,
};

/// Identifies a table file.
pub const SUPERBLOCK_MAGIC: &[u8; 19] = b"transactional-store";
/// Superblock layout version.
pub const SUPERBLOCK_VERSION: u16 = 1;
/// Page holding the superblock.
pub const SUPERBLOCK_PAGE: PageId = PageId(0);
/// Page holding the table's catalog entry.
pub const CATALOG_PAGE: PageId = PageId(1);
/// First page available to the fragment allocator.
pub const FIRST_DATA_PAGE: PageId = PageId(2);
/// Smallest page size a store may be created with.
pub const MIN_PAGE_SIZE: u32 = 4 << 10;
/// Largest page size a store may be created with.
pub const MAX_PAGE_SIZE: u32 = 64 << 10;

const SB_MAGIC: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 19;
const SB_VERSION: Range<usize> = PAGE_HDR_LEN + 20..PAGE_HDR_LEN + 22;
const SB_PAGE_SIZE: Range<usize> = PAGE_HDR_LEN + 24..PAGE_HDR_LEN + 28;
const SB_NEXT_PAGE: Range<usize> = PAGE_HDR_LEN + 32..PAGE_HDR_LEN + 40;
const SB_CATALOG_ROOT: Range<usize> = PAGE_HDR_LEN + 40..PAGE_HDR_LEN + 48;
const SB_FILE_ID: Range<usize> = PAGE_HDR_LEN + 48..PAGE_HDR_LEN + 56;

/// Bytes that must be read to learn a file's page size.
pub(crate) const SUPERBLOCK_PROBE_LEN: usize = PAGE_HDR_LEN + 56;

/// Contents of page 0 plus the catalog page of one table file.
#[derive(Clone, PartialEq, Eq)]
pub struct Meta {
    /// Page size fixed at creation.
    pub page_size: u32,
    /// Superblock layout version.
    pub version: u16,
    /// First page number never handed out.
    pub next_page: PageId,
    /// Page holding the catalog entry.
    pub catalog_root: PageId,
    /// Random identifier minted when the file was created.
    pub file_id: u64,
    /// Table stored in this file.
    pub table: TableId,
    /// Table name.
    pub name: String,
}

impl fmt::Debug for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meta")
            .field("table", &self.table)
            .field("name", &self.name)
            .field("page_size", &self.page_size)
            .field("next_page", &self.next_page)
            .field("file_id", &format_args!("{:016x}", self.file_id))
            .finish()
    }
}

impl Meta {
    /// Metadata for a brand new table file.
    pub fn fresh(page_size: u32, table: TableId, name: &str) -> Result<Self> {
        validate_page_size(page_size)?;
        Ok(Self {
            page_size,
            version: SUPERBLOCK_VERSION,
            next_page: FIRST_DATA_PAGE,
            catalog_root: CATALOG_PAGE,
            file_id: OsRng.next_u64(),
            table,
            name: name.to_owned(),
        })
    }
}

/// Page sizes must be powers of two between 4 KiB and 64 KiB.
pub fn validate_page_size(page_size: u32) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(TesseraError::bad_argument(format!(
            "page size {page_size} must be a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}"
        )));
    }
    Ok(())
}

/// Fills `page` with the superblock image (checksum left for the writer).
pub fn write_superblock(page: &mut [u8], meta: &Meta) -> Result<()> {
    page.fill(0);
    PageHeader::new(PageKind::Superblock, SUPERBLOCK_PAGE).encode(page)?;
    page[SB_MAGIC].copy_from_slice(SUPERBLOCK_MAGIC);
    le::put_u16(&mut page[SB_VERSION], meta.version);
    le::put_u32(&mut page[SB_PAGE_SIZE], meta.page_size);
    le::put_u64(&mut page[SB_NEXT_PAGE], meta.next_page.0);
    le::put_u64(&mut page[SB_CATALOG_ROOT], meta.catalog_root.0);
    le::put_u64(&mut page[SB_FILE_ID], meta.file_id);
    Ok(())
}

/// Page size advertised by a superblock prefix, before checksum verification.
pub fn probe_page_size(prefix: &[u8]) -> Result<u32> {
    if prefix.len() < SUPERBLOCK_PROBE_LEN || &prefix[SB_MAGIC] != SUPERBLOCK_MAGIC {
        return Err(TesseraError::corrupt("table file superblock magic mismatch"));
    }
    let page_size = le::get_u32(&prefix[SB_PAGE_SIZE]);
    validate_page_size(page_size)
        .map_err(|_| TesseraError::corrupt(format!("superblock page size {page_size}")))?;
    Ok(page_size)
}

/// Parses a verified superblock page. Table identity comes from the catalog.
pub fn read_superblock(page: &[u8]) -> Result<Meta> {
    let header = PageHeader::decode(page)?;
    if header.kind != PageKind::Superblock {
        return Err(TesseraError::corrupt("page 0 is not a superblock"));
    }
    let page_size = probe_page_size(page)?;
    let version = le::get_u16(&page[SB_VERSION]);
    if version != SUPERBLOCK_VERSION {
        return Err(TesseraError::corrupt(format!(
            "unsupported superblock version {version}"
        )));
    }
    let next_page = PageId(le::get_u64(&page[SB_NEXT_PAGE]));
    if next_page < FIRST_DATA_PAGE {
        return Err(TesseraError::corrupt(format!(
            "superblock next_page {next_page} below first data page"
        )));
    }
    Ok(Meta {
        page_size,
        version,
        next_page,
        catalog_root: PageId(le::get_u64(&page[SB_CATALOG_ROOT])),
        file_id: le::get_u64(&page[SB_FILE_ID]),
        table: TableId(0),
        name: String::new(),
    })
}

/// Fills `page` with the catalog entry naming the table.
pub fn write_catalog(page: &mut [u8], meta: &Meta) -> Result<()> {
    page.fill(0);
    PageHeader::new(PageKind::Catalog, meta.catalog_root).encode(page)?;
    let mut w = buf::Writer::new();
    w.u32(meta.table.0).blob(meta.name.as_bytes());
    let body = w.finish();
    let dst = page
        .get_mut(PAGE_HDR_LEN..PAGE_HDR_LEN + body.len())
        .ok_or_else(|| TesseraError::bad_argument("table name does not fit the catalog page"))?;
    dst.copy_from_slice(&body);
    Ok(())
}

/// Reads the table id and name from a verified catalog page into `meta`.
pub fn read_catalog(page: &[u8], meta: &mut Meta) -> Result<()> {
    let header = PageHeader::decode(page)?;
    if header.kind != PageKind::Catalog {
        return Err(TesseraError::corrupt(format!(
            "page {} is not a catalog page",
            header.page_no
        )));
    }
    let mut r = buf::Reader::new(&page[PAGE_HDR_LEN..]);
    meta.table = TableId(r.u32()?);
    meta.name = String::from_utf8(r.blob()?)
        .map_err(|_| TesseraError::corrupt("catalog table name is not UTF-8"))?;
    Ok(())
}
