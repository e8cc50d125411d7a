//! Record fragments straddling WAL segment boundaries within a delta group.
//!
//! For segment `i` of a group, `heads[i]` is the unfinished record left at
//! its end and `tails[i]` the continuation found at its start. Record `i`
//! is therefore `heads[i - 1] + tails[i]`, with `previous_head` standing in
//! for the head of the previous group's last segment.

use std::io::{self, Read, Write};

use crate::{relfile::BlockLocation, wal::WalDecoder, Error, Result};

use super::names::WAL_FILE_IN_DELTA;

const SLOTS: usize = WAL_FILE_IN_DELTA as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalPartType {
    Tail = 0,
    Head = 1,
    PreviousHead = 2,
}

impl TryFrom<u8> for WalPartType {
    type Error = anyhow::Error;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Tail),
            1 => Ok(Self::Head),
            2 => Ok(Self::PreviousHead),
            other => Err(Error::InvalidWalPartFile {
                reason: format!("unknown part type {other}"),
            }
            .into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalPartFile {
    pub tails: [Option<Vec<u8>>; SLOTS],
    pub heads: [Option<Vec<u8>>; SLOTS],
    pub previous_head: Option<Vec<u8>>,
}

impl Default for WalPartFile {
    fn default() -> Self {
        Self {
            tails: std::array::from_fn(|_| None),
            heads: std::array::from_fn(|_| None),
            previous_head: None,
        }
    }
}

impl WalPartFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fragment of the group has been seen.
    pub fn is_complete(&self) -> bool {
        self.previous_head.is_some()
            && self.tails.iter().all(Option::is_some)
            && self.heads.iter().all(Option::is_some)
    }

    fn set_part(&mut self, kind: WalPartType, slot: u8, data: Vec<u8>) -> Result<()> {
        if slot as usize >= SLOTS {
            return Err(Error::InvalidWalPartFile {
                reason: format!("slot {slot} out of range"),
            }
            .into());
        }
        match kind {
            WalPartType::Tail => self.tails[slot as usize] = Some(data),
            WalPartType::Head => self.heads[slot as usize] = Some(data),
            WalPartType::PreviousHead => self.previous_head = Some(data),
        }
        Ok(())
    }

    /// Reassemble the records split across segment boundaries and decode
    /// the locations they touch.
    pub fn combine_records(&self, decoder: &dyn WalDecoder) -> Result<Vec<BlockLocation>> {
        let empty = Vec::new();
        let mut locations = Vec::new();
        for id in 0..SLOTS {
            let head = if id == 0 {
                self.previous_head.as_ref()
            } else {
                self.heads[id - 1].as_ref()
            };
            let head = head.unwrap_or(&empty);
            let tail = self.tails[id].as_ref().unwrap_or(&empty);
            // A record needs its start; a bare continuation cannot be decoded.
            if head.is_empty() {
                continue;
            }
            let mut record = Vec::with_capacity(head.len() + tail.len());
            record.extend_from_slice(head);
            record.extend_from_slice(tail);
            locations.extend(decoder.record_locations(&record)?);
        }
        Ok(locations)
    }

    /// A part file whose recording started mid-group: no previous head and
    /// a consistent run of missing slots before the first recorded segment.
    /// Returns the first recorded slot.
    pub fn partially_filled_start(&self) -> Result<Option<usize>> {
        if self.previous_head.is_some() {
            return Ok(None);
        }
        for i in 0..SLOTS {
            match (self.heads[i].is_some(), self.tails[i].is_some()) {
                (true, true) => return Ok(Some(i)),
                (false, false) => continue,
                _ => {
                    return Err(Error::InvalidWalPartFile {
                        reason: "inconsistent state between wal heads and wal tails".into(),
                    }
                    .into())
                }
            }
        }
        Ok(None)
    }

    /// Mark the slots before `index` (and the previous head) as empty so a
    /// group that began recording mid-way can be combined.
    pub fn complete_partially_filled(&mut self, index: usize) {
        self.previous_head = Some(Vec::new());
        for i in 0..index.min(SLOTS) {
            self.tails[i] = Some(Vec::new());
            self.heads[i] = Some(Vec::new());
        }
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut write_part = |kind: WalPartType, slot: usize, data: &[u8]| -> io::Result<()> {
            writer.write_all(&[kind as u8, slot as u8])?;
            writer.write_all(&(data.len() as u32).to_le_bytes())?;
            writer.write_all(data)
        };
        for (slot, data) in self.tails.iter().enumerate() {
            if let Some(data) = data {
                write_part(WalPartType::Tail, slot, data)?;
            }
        }
        if let Some(data) = &self.previous_head {
            write_part(WalPartType::PreviousHead, 0, data)?;
        }
        for (slot, data) in self.heads.iter().enumerate() {
            if let Some(data) = data {
                write_part(WalPartType::Head, slot, data)?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.save(&mut out)?;
        Ok(out)
    }

    /// Read parts until end of stream.
    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let mut part_file = Self::new();
        loop {
            let mut prefix = [0u8; 2];
            let n = read_fully(reader, &mut prefix)?;
            if n == 0 {
                return Ok(part_file);
            }
            let mut len_buf = [0u8; 4];
            if n < prefix.len() || read_fully(reader, &mut len_buf)? < len_buf.len() {
                return Err(truncated());
            }
            let mut data = vec![0u8; u32::from_le_bytes(len_buf) as usize];
            if read_fully(reader, &mut data)? < data.len() {
                return Err(truncated());
            }
            part_file.set_part(WalPartType::try_from(prefix[0])?, prefix[1], data)?;
        }
    }
}

fn truncated() -> anyhow::Error {
    Error::InvalidWalPartFile {
        reason: "truncated part".into(),
    }
    .into()
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
