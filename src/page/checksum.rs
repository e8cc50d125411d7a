//! PostgreSQL data page checksums (`checksum_impl.h`) and page verification.
//!
//! The block checksum is FNV-1a computed over 32 interleaved lanes of
//! 4-byte words, folded with xor, mixed with the absolute block number and
//! reduced into `1..=65535`.

use std::{fs::File, os::unix::fs::FileExt, path::Path};

use tracing::{debug, warn};

use crate::{
    relfile::{rel_file_segment_no, BLOCKS_IN_REL_FILE},
    Result,
};

use super::{PageHeader, PAGE_SIZE};

const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16_777_619;
const PD_CHECKSUM_OFFSET: usize = 8;

const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BEC979, 0xCCA6C0B2, 0x304A0979, 0x85AA43D4,
    0x783125BB, 0x6CA8EAA2, 0xE407EAC6, 0x4B5CFC3E, 0x9FBF8C76, 0x15CA20BE, 0xF2CA9FD3, 0x959BD756,
];

/// Files that never carry checksummed pages.
const IGNORED_FILE_NAMES: &[&str] = &["pg_internal.init"];

#[inline]
fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

fn checksum_block(page: &[u8]) -> u32 {
    let mut sums = CHECKSUM_BASE_OFFSETS;
    for row in page.chunks_exact(N_SUMS * 4) {
        for (j, word) in row.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            sums[j] = checksum_comp(sums[j], value);
        }
    }
    for _ in 0..2 {
        for sum in sums.iter_mut() {
            *sum = checksum_comp(*sum, 0);
        }
    }
    sums.iter().fold(0, |acc, s| acc ^ s)
}

/// `pg_checksum_page`: checksum of `page` as if stored at absolute `block_no`.
///
/// The stored `pd_checksum` field is ignored.
pub fn page_checksum(page: &[u8], block_no: u32) -> u16 {
    let mut copy = [0u8; PAGE_SIZE];
    let len = page.len().min(PAGE_SIZE);
    copy[..len].copy_from_slice(&page[..len]);
    copy[PD_CHECKSUM_OFFSET] = 0;
    copy[PD_CHECKSUM_OFFSET + 1] = 0;
    let checksum = checksum_block(&copy) ^ block_no;
    ((checksum % 65535) + 1) as u16
}

/// Whether a page fails checksum verification. New pages and pages with a
/// zero checksum (checksums disabled) are never reported.
pub fn is_page_corrupted(page: &[u8], absolute_block_no: u32) -> bool {
    let header = PageHeader::parse(page);
    if header.is_new() || header.checksum == 0 {
        return false;
    }
    let computed = page_checksum(page, absolute_block_no);
    if computed != header.checksum {
        warn!(
            block_no = absolute_block_no,
            stored = header.checksum,
            computed,
            "page checksum mismatch"
        );
        return true;
    }
    false
}

/// Verify the listed segment-local blocks of a data file and return the
/// corrupt ones (segment-local numbering).
pub fn verify_pages(path: &Path, file: &File, blocks: &[u32]) -> Result<Vec<u32>> {
    let ignored = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| IGNORED_FILE_NAMES.contains(&n))
        .unwrap_or(false);
    if ignored {
        return Ok(Vec::new());
    }

    let segment_offset = rel_file_segment_no(path).unwrap_or(0) * BLOCKS_IN_REL_FILE;
    let len = file.metadata()?.len();
    let mut page = vec![0u8; PAGE_SIZE];
    let mut corrupt = Vec::new();
    for &block in blocks {
        let offset = block as u64 * PAGE_SIZE as u64;
        if offset + PAGE_SIZE as u64 > len {
            warn!(path = %path.display(), size = len, "file size is not page aligned");
            break;
        }
        file.read_exact_at(&mut page, offset)?;
        if is_page_corrupted(&page, segment_offset + block) {
            corrupt.push(block);
        }
    }
    debug!(
        path = %path.display(),
        checked = blocks.len(),
        corrupt = corrupt.len(),
        "verified pages"
    );
    Ok(corrupt)
}

/// Verify every page of a data file.
pub fn verify_paged_file(path: &Path, file: &File, file_size: u64) -> Result<Vec<u32>> {
    let pages = file_size.div_ceil(PAGE_SIZE as u64) as u32;
    let blocks: Vec<u32> = (0..pages).collect();
    verify_pages(path, file, &blocks)
}
