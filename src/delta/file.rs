//! Serialized change record of one delta group.

use std::io::{self, Read, Write};

use crate::{relfile::BlockLocation, wal::ParserState, Error, Result};

/// Locations recorded for a delta group plus the parser continuation needed
/// to read the first segment of the next group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaFile {
    pub locations: Vec<BlockLocation>,
    pub parser_state: ParserState,
}

fn invalid(reason: impl Into<String>) -> anyhow::Error {
    Error::InvalidDeltaFile {
        reason: reason.into(),
    }
    .into()
}

fn read_exact_or_invalid<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(invalid(format!("truncated {what}"))),
        Err(e) => Err(e.into()),
    }
}

impl DeltaFile {
    pub fn new(parser_state: ParserState) -> Self {
        Self {
            locations: Vec::new(),
            parser_state,
        }
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.locations.len() as u32).to_le_bytes())?;
        for location in &self.locations {
            writer.write_all(&location.to_bytes())?;
        }
        writer.write_all(&BlockLocation::default().to_bytes())?;
        let state = &self.parser_state.current_record;
        writer.write_all(&(state.len() as u32).to_le_bytes())?;
        writer.write_all(state)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8 + (self.locations.len() + 1) * BlockLocation::ENCODED_LEN);
        self.save(&mut out)?;
        Ok(out)
    }

    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let mut count_buf = [0u8; 4];
        read_exact_or_invalid(reader, &mut count_buf, "location count")?;
        let count = u32::from_le_bytes(count_buf) as usize;

        let mut locations = Vec::with_capacity(count.min(1 << 20));
        let mut raw = [0u8; BlockLocation::ENCODED_LEN];
        for _ in 0..count {
            read_exact_or_invalid(reader, &mut raw, "location list")?;
            locations.push(BlockLocation::from_bytes(&raw));
        }
        read_exact_or_invalid(reader, &mut raw, "terminator")?;
        if !BlockLocation::from_bytes(&raw).is_terminator() {
            return Err(invalid("location list is not terminated"));
        }

        let mut len_buf = [0u8; 4];
        read_exact_or_invalid(reader, &mut len_buf, "parser state length")?;
        let mut state = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        read_exact_or_invalid(reader, &mut state, "parser state")?;

        Ok(Self {
            locations,
            parser_state: ParserState::new(state),
        })
    }

    /// Whether the group's last segment ended in the middle of a record.
    pub fn has_beginning(&self) -> bool {
        self.parser_state.has_beginning()
    }
}
