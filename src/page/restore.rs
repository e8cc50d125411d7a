//! Restore algorithms applying incremental files to local data files.
//!
//! All functions take the increment as a plain byte stream positioned at
//! the magic and write pages in place with positioned I/O.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read},
    os::unix::fs::FileExt,
    path::Path,
};

use tracing::{debug, warn};

use crate::{Error, Result};

use super::{increment::read_increment_header, is_zero_header, PAGE_HEADER_SIZE, PAGE_SIZE};

fn page_offset(block_no: u64) -> u64 {
    block_no * PAGE_SIZE as u64
}

fn page_count(file: &File) -> Result<u64> {
    Ok(file.metadata()?.len() / PAGE_SIZE as u64)
}

fn is_missing_page(file: &File, block_no: u64) -> Result<bool> {
    let mut header = [0u8; PAGE_HEADER_SIZE];
    file.read_exact_at(&mut header, page_offset(block_no))?;
    Ok(is_zero_header(&header))
}

/// Write one page already read from the stream. Without `overwrite` the page
/// only lands where the local page header is all zero.
fn write_page(file: &File, block_no: u64, page: &[u8], overwrite: bool) -> Result<()> {
    if !overwrite && !is_missing_page(file, block_no)? {
        return Ok(());
    }
    file.write_all_at(page, page_offset(block_no))?;
    Ok(())
}

/// Fill a whole page from `reader`. `Ok(false)` means clean EOF before the
/// first byte.
fn read_page<R: Read>(reader: &mut R, page: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < page.len() {
        match reader.read(&mut page[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn has_trailing_data<R: Read>(reader: &mut R) -> io::Result<bool> {
    let mut peek = [0u8; 1];
    loop {
        match reader.read(&mut peek) {
            Ok(n) => return Ok(n > 0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

fn verify_stream_is_empty<R: Read>(reader: &mut R) -> Result<()> {
    if has_trailing_data(reader)? {
        return Err(Error::UnexpectedTarData.into());
    }
    Ok(())
}

fn read_required_page<R: Read>(reader: &mut R, page: &mut [u8]) -> Result<()> {
    if !read_page(reader, page)? {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(())
}

/// Write a brand-new file: pages from the increment where named, zero pages
/// everywhere else up to the recorded file size.
pub fn create_file_from_increment<R: Read>(increment: &mut R, file: &File) -> Result<()> {
    let header = read_increment_header(increment)?;
    debug!(
        file_size = header.file_size,
        pages = header.blocks.len(),
        "creating file from increment"
    );

    let page_count = header.page_count();
    let mut blocks = header.blocks.clone();
    blocks.sort_unstable();
    let mut page = vec![0u8; PAGE_SIZE];
    let zero_page = vec![0u8; PAGE_SIZE];

    // Pages arrive in header order; remember where each one goes.
    for &block in &header.blocks {
        read_required_page(increment, &mut page)?;
        if (block as u64) < page_count {
            file.write_all_at(&page, page_offset(block as u64))?;
        }
    }
    for block_no in 0..page_count {
        if blocks.binary_search(&(block_no as u32)).is_err() {
            file.write_all_at(&zero_page, page_offset(block_no))?;
        }
    }
    verify_stream_is_empty(increment)?;
    file.sync_all()?;
    Ok(())
}

/// Update an existing file in place.
///
/// Blocks past the local page count are consumed and dropped. With
/// `overwrite` unset only zero-header (missing) pages are replaced.
pub fn write_pages_from_increment<R: Read>(
    increment: &mut R,
    file: &File,
    overwrite: bool,
) -> Result<()> {
    let header = read_increment_header(increment)?;
    let local_pages = page_count(file)?;
    debug!(
        pages = header.blocks.len(),
        local_pages, overwrite, "writing pages from increment"
    );

    let mut page = vec![0u8; PAGE_SIZE];
    for &block in &header.blocks {
        read_required_page(increment, &mut page)?;
        if block as u64 >= local_pages {
            continue;
        }
        write_page(file, block as u64, &page, overwrite)?;
    }
    verify_stream_is_empty(increment)?;
    file.sync_all()?;
    Ok(())
}

/// Catch-up variant: always overwrites, stops quietly on a truncated stream
/// and ignores data left after the last declared page.
pub fn catchup_pages_from_increment<R: Read>(increment: &mut R, file: &File) -> Result<()> {
    let header = read_increment_header(increment)?;
    let local_pages = page_count(file)?;

    let mut page = vec![0u8; PAGE_SIZE];
    for &block in &header.blocks {
        match read_page(increment, &mut page) {
            Ok(true) => {}
            Ok(false) => {
                warn!(block, "increment ended before all declared pages");
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(block, "increment truncated inside a page");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        if block as u64 >= local_pages {
            continue;
        }
        file.write_all_at(&page, page_offset(block as u64))?;
    }
    if has_trailing_data(increment)? {
        warn!("extra data after increment pages ignored");
    }
    file.sync_all()?;
    Ok(())
}

/// Fill every zero-header page of `file` from the matching page of a base
/// backup stream. Stops at the end of either; a base stream ending inside
/// a page is an error.
pub fn restore_missing_pages<R: Read>(base: &mut R, file: &File) -> Result<()> {
    let local_pages = page_count(file)?;
    let mut page = vec![0u8; PAGE_SIZE];
    for block_no in 0..local_pages {
        if !read_page(base, &mut page)? {
            break;
        }
        write_page(file, block_no, &page, false)?;
    }
    if has_trailing_data(base)? {
        debug!("skipping base pages after end of the local file, possibly truncated");
    }
    file.sync_all()?;
    Ok(())
}

/// Whole-file convenience wrapper: overwrite every page named in the
/// increment and truncate or extend to the recorded size.
pub fn apply_file_increment<R: Read>(path: &Path, increment: &mut R) -> Result<()> {
    let header = read_increment_header(increment)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let mut page = vec![0u8; PAGE_SIZE];
    for &block in &header.blocks {
        read_required_page(increment, &mut page)?;
        file.write_all_at(&page, page_offset(block as u64))?;
    }
    verify_stream_is_empty(increment)?;
    file.set_len(header.file_size)?;
    file.sync_all()?;
    Ok(())
}
