//! Lazy producer of incremental files from a data file on disk.

use std::{
    fs::File,
    io::{self, Read},
    os::unix::fs::FileExt,
    path::Path,
};

use roaring::RoaringBitmap;

use crate::{
    limit::DiskLimiter,
    relfile::{rel_file_node_from_path, rel_file_segment_no, BlockLocation, BLOCKS_IN_REL_FILE},
    Error, Result,
};

use super::{increment::IncrementHeader, select_page, PageSelection, PAGE_SIZE};

/// Streams an incremental file: the encoded header first, then each
/// selected page read from disk on demand.
#[derive(Debug)]
pub struct IncrementalPageReader {
    file: File,
    header: IncrementHeader,
    next: usize,
    buf: Vec<u8>,
    pos: usize,
    limiter: DiskLimiter,
}

impl IncrementalPageReader {
    /// Scan every page of `file` and keep those changed after `base_lsn`.
    ///
    /// Fails with [`Error::InvalidBlock`] on the first page whose header is
    /// neither valid nor new, and on a trailing partial page. A file that
    /// got shorter than `file_size` is scanned up to its real end.
    pub fn full_scan(
        file: File,
        file_size: u64,
        base_lsn: u64,
        limiter: DiskLimiter,
    ) -> Result<Self> {
        let blocks = scan_changed_blocks(&file, file_size, base_lsn, &limiter)?;
        Ok(Self::with_blocks(file, file_size, blocks, limiter))
    }

    /// Take the blocks named in `bitmap` that fit inside `file_size`.
    ///
    /// Block numbers must already be local to this segment file.
    pub fn from_bitmap(
        file: File,
        file_size: u64,
        bitmap: &RoaringBitmap,
        limiter: DiskLimiter,
    ) -> Self {
        let mut blocks = Vec::with_capacity(bitmap.len() as usize);
        for block in bitmap.iter() {
            if (block as u64 + 1) * PAGE_SIZE as u64 > file_size {
                break;
            }
            blocks.push(block);
        }
        Self::with_blocks(file, file_size, blocks, limiter)
    }

    fn with_blocks(file: File, file_size: u64, blocks: Vec<u32>, limiter: DiskLimiter) -> Self {
        let header = IncrementHeader::new(file_size, blocks);
        let buf = header.to_bytes();
        Self {
            file,
            header,
            next: 0,
            buf,
            pos: 0,
            limiter,
        }
    }

    pub fn header(&self) -> &IncrementHeader {
        &self.header
    }

    /// Total number of bytes this reader will produce.
    pub fn encoded_len(&self) -> u64 {
        self.header.encoded_len()
    }

    fn load_next_page(&mut self) -> io::Result<bool> {
        let Some(&block) = self.header.blocks.get(self.next) else {
            return Ok(false);
        };
        self.next += 1;
        let mut page = vec![0u8; PAGE_SIZE];
        if !read_page_at(&self.file, &mut page, block as u64)? {
            // Truncated since the scan; the page is shipped zeroed.
            page.fill(0);
        }
        self.limiter.wait(PAGE_SIZE);
        self.buf = page;
        self.pos = 0;
        Ok(true)
    }
}

impl Read for IncrementalPageReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.buf.len() && !self.load_next_page()? {
            return Ok(0);
        }
        let n = (self.buf.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn scan_changed_blocks(
    file: &File,
    file_size: u64,
    base_lsn: u64,
    limiter: &DiskLimiter,
) -> Result<Vec<u32>> {
    let page_count = file_size / PAGE_SIZE as u64;
    let mut blocks = Vec::new();
    let mut page = vec![0u8; PAGE_SIZE];
    for block_no in 0..page_count {
        if !read_page_at(file, &mut page, block_no)? {
            // The relation was truncated after it was sized; WAL replay
            // restores the tail.
            tracing::debug!(block_no, file_size, "relation shrank during scan");
            return Ok(blocks);
        }
        limiter.wait(PAGE_SIZE);
        match select_page(&page, base_lsn) {
            PageSelection::Take => blocks.push(block_no as u32),
            PageSelection::Skip => {}
            PageSelection::Invalid => {
                tracing::warn!(block_no, "invalid page header");
                return Err(Error::InvalidBlock {
                    block_no: block_no as u32,
                }
                .into());
            }
        }
    }
    if file_size % PAGE_SIZE as u64 != 0 {
        return Err(Error::InvalidBlock {
            block_no: page_count as u32,
        }
        .into());
    }
    Ok(blocks)
}

/// Read page `block_no` into `page`. Returns `false` when the file ends
/// before a whole page.
fn read_page_at(file: &File, page: &mut [u8], block_no: u64) -> io::Result<bool> {
    let offset = block_no * PAGE_SIZE as u64;
    let mut filled = 0;
    while filled < page.len() {
        match file.read_at(&mut page[filled..], offset + filled as u64) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

/// Open `path` and build its increment relative to `base_lsn`.
///
/// With `bitmap` only the named blocks are shipped; without it every page
/// is scanned. Returns the stream and its exact encoded length.
pub fn read_incremental_file(
    path: &Path,
    file_size: u64,
    base_lsn: u64,
    bitmap: Option<&RoaringBitmap>,
    limiter: &DiskLimiter,
) -> Result<(IncrementalPageReader, u64)> {
    let file = File::open(path)?;
    let reader = match bitmap {
        Some(bitmap) => IncrementalPageReader::from_bitmap(file, file_size, bitmap, limiter.clone()),
        None => IncrementalPageReader::full_scan(file, file_size, base_lsn, limiter.clone())?,
    };
    let size = reader.encoded_len();
    Ok((reader, size))
}

/// Scan a data file and return the absolute locations of pages changed
/// after `base_lsn`.
pub fn read_increment_locations(
    path: &Path,
    file_size: u64,
    base_lsn: u64,
) -> Result<Vec<BlockLocation>> {
    let rel = rel_file_node_from_path(path)?;
    let segment = rel_file_segment_no(path)?;
    let file = File::open(path)?;
    let blocks = scan_changed_blocks(&file, file_size, base_lsn, &DiskLimiter::unlimited())?;
    let offset = segment * BLOCKS_IN_REL_FILE;
    Ok(blocks
        .into_iter()
        .map(|block| BlockLocation {
            rel,
            block_no: block + offset,
        })
        .collect())
}
