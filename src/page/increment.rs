//! Increment header encode/decode.

use std::io::{self, Read, Write};

use crate::{Error, Result};

use super::PAGE_SIZE;

/// Magic `"wi1"` followed by the signature byte.
pub const INCREMENT_FILE_HEADER: [u8; 4] = [b'w', b'i', b'1', SIGNATURE_MAGIC_NUMBER];
const SIGNATURE_MAGIC_NUMBER: u8 = 0x55;
const SUPPORTED_VERSION: u8 = b'1';

/// Fixed prefix length: magic, file size, block count.
pub const INCREMENT_PREFIX_SIZE: u64 = 4 + 8 + 4;

/// Decoded header of an incremental file, without the page payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IncrementHeader {
    /// Size of the source file at the time the increment was taken.
    pub file_size: u64,
    /// Changed block numbers in payload order.
    pub blocks: Vec<u32>,
}

impl IncrementHeader {
    pub fn new(file_size: u64, blocks: Vec<u32>) -> Self {
        Self { file_size, blocks }
    }

    /// Number of pages in the source file.
    pub fn page_count(&self) -> u64 {
        self.file_size / PAGE_SIZE as u64
    }

    /// Encoded header length (prefix plus block list).
    pub fn header_len(&self) -> u64 {
        INCREMENT_PREFIX_SIZE + 4 * self.blocks.len() as u64
    }

    /// Total incremental file length including page payload.
    pub fn encoded_len(&self) -> u64 {
        encoded_increment_size(self.blocks.len() as u64)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len() as usize);
        out.extend_from_slice(&INCREMENT_FILE_HEADER);
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        for block in &self.blocks {
            out.extend_from_slice(&block.to_le_bytes());
        }
        out
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }
}

/// Size of an increment carrying `changed_blocks` pages.
pub fn encoded_increment_size(changed_blocks: u64) -> u64 {
    INCREMENT_PREFIX_SIZE + changed_blocks * (4 + PAGE_SIZE as u64)
}

/// Validate the 4-byte magic.
pub fn check_magic(magic: &[u8; 4]) -> Result<()> {
    if magic[0] != INCREMENT_FILE_HEADER[0]
        || magic[1] != INCREMENT_FILE_HEADER[1]
        || magic[3] != SIGNATURE_MAGIC_NUMBER
    {
        return Err(Error::InvalidIncrementFileHeader.into());
    }
    if magic[2] != SUPPORTED_VERSION {
        return Err(Error::UnknownIncrementFileHeader(magic[2]).into());
    }
    Ok(())
}

/// Read the magic, file size, and block list from the front of an increment.
///
/// The reader is left positioned at the first page of the payload.
pub fn read_increment_header<R: Read>(reader: &mut R) -> Result<IncrementHeader> {
    let mut magic = [0u8; 4];
    read_exact_or_header_error(reader, &mut magic)?;
    check_magic(&magic)?;

    let mut size_buf = [0u8; 8];
    read_exact_or_header_error(reader, &mut size_buf)?;
    let file_size = u64::from_le_bytes(size_buf);

    let mut count_buf = [0u8; 4];
    read_exact_or_header_error(reader, &mut count_buf)?;
    let count = u32::from_le_bytes(count_buf) as usize;

    let mut raw = vec![0u8; count * 4];
    read_exact_or_header_error(reader, &mut raw)?;
    let blocks = raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok(IncrementHeader { file_size, blocks })
}

fn read_exact_or_header_error<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(Error::InvalidIncrementFileHeader.into())
        }
        Err(e) => Err(e.into()),
    }
}
