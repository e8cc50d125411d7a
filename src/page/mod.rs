//! PostgreSQL data page primitives and the incremental file codec.
//!
//! Incremental file layout:
//! 4 bytes header: `"wi1"` plus the signature byte
//! 8 bytes file size
//! 4 bytes changed page count N
//! N * 4 bytes block numbers of changed pages
//! N * PAGE_SIZE bytes page data, in block-number order

pub mod checksum;
pub mod increment;
pub mod reader;
pub mod restore;

pub use checksum::{is_page_corrupted, page_checksum, verify_paged_file, verify_pages};
pub use increment::{encoded_increment_size, read_increment_header, IncrementHeader, INCREMENT_FILE_HEADER};
pub use reader::{read_increment_locations, read_incremental_file, IncrementalPageReader};
pub use restore::{
    apply_file_increment, catchup_pages_from_increment, create_file_from_increment,
    restore_missing_pages, write_pages_from_increment,
};

/// PostgreSQL page size (`BLCKSZ`, 8 KiB).
pub const PAGE_SIZE: usize = 8192;
/// Size of `PageHeaderData` on disk.
pub const PAGE_HEADER_SIZE: usize = 24;
/// Page layout version written by every supported server release.
pub const PAGE_LAYOUT_VERSION: u16 = 4;
/// `PD_VALID_FLAG_BITS`.
pub const VALID_FLAGS: u16 = 0x0007;
/// The zero LSN never appears on an initialized page.
pub const INVALID_LSN: u64 = 0;

/// Parsed `PageHeaderData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageHeader {
    pub lsn_hi: u32,
    pub lsn_lo: u32,
    pub checksum: u16,
    pub flags: u16,
    pub lower: u16,
    pub upper: u16,
    pub special: u16,
    pub page_size_version: u16,
    pub prune_xid: u32,
}

impl PageHeader {
    /// Parse the header from the first 24 bytes of `page`.
    ///
    /// Short input is treated as zero-filled, which makes it an invalid
    /// (or new) page rather than a read error.
    pub fn parse(page: &[u8]) -> Self {
        let mut raw = [0u8; PAGE_HEADER_SIZE];
        let len = page.len().min(PAGE_HEADER_SIZE);
        raw[..len].copy_from_slice(&page[..len]);

        let u16_at = |off: usize| u16::from_le_bytes([raw[off], raw[off + 1]]);
        let u32_at =
            |off: usize| u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]]);

        Self {
            lsn_hi: u32_at(0),
            lsn_lo: u32_at(4),
            checksum: u16_at(8),
            flags: u16_at(10),
            lower: u16_at(12),
            upper: u16_at(14),
            special: u16_at(16),
            page_size_version: u16_at(18),
            prune_xid: u32_at(20),
        }
    }

    pub fn lsn(&self) -> u64 {
        ((self.lsn_hi as u64) << 32) | self.lsn_lo as u64
    }

    /// A page that was never written by the server.
    pub fn is_new(&self) -> bool {
        self.upper == 0
    }

    pub fn is_valid(&self) -> bool {
        !((self.flags & VALID_FLAGS) != self.flags
            || (self.lower as usize) < PAGE_HEADER_SIZE
            || self.lower > self.upper
            || self.upper > self.special
            || self.special as usize > PAGE_SIZE
            || self.lsn() == INVALID_LSN
            || self.page_size_version as usize != PAGE_SIZE + PAGE_LAYOUT_VERSION as usize)
    }

    /// Serialize back into the 24-byte on-disk form.
    pub fn to_bytes(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut out = [0u8; PAGE_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.lsn_hi.to_le_bytes());
        out[4..8].copy_from_slice(&self.lsn_lo.to_le_bytes());
        out[8..10].copy_from_slice(&self.checksum.to_le_bytes());
        out[10..12].copy_from_slice(&self.flags.to_le_bytes());
        out[12..14].copy_from_slice(&self.lower.to_le_bytes());
        out[14..16].copy_from_slice(&self.upper.to_le_bytes());
        out[16..18].copy_from_slice(&self.special.to_le_bytes());
        out[18..20].copy_from_slice(&self.page_size_version.to_le_bytes());
        out[20..24].copy_from_slice(&self.prune_xid.to_le_bytes());
        out
    }
}

/// Outcome of inspecting one page during a full-file scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSelection {
    /// Changed after the base LSN (or new); must be shipped.
    Take,
    /// Unchanged since the base LSN.
    Skip,
    /// Header failed validation; the file cannot be incremented.
    Invalid,
}

/// Decide whether a page belongs in an increment relative to `base_lsn`.
///
/// New pages carry no LSN and are never taken.
pub fn select_page(page: &[u8], base_lsn: u64) -> PageSelection {
    let header = PageHeader::parse(page);
    if !header.is_valid() {
        if header.is_new() {
            return PageSelection::Skip;
        }
        return PageSelection::Invalid;
    }
    if header.lsn() > base_lsn {
        PageSelection::Take
    } else {
        PageSelection::Skip
    }
}

/// Whether the first header bytes of a page are all zero ("missing" page).
pub fn is_zero_header(page: &[u8]) -> bool {
    page.iter().take(PAGE_HEADER_SIZE).all(|b| *b == 0)
}
