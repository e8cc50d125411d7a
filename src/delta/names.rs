//! WAL segment, delta group, and part file naming.

use std::fmt;

use crate::{Error, Result};

/// WAL segment size (16 MiB, the server default).
pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
/// Segments sharing one `xlogid` in segment file names.
pub const SEGMENTS_PER_XLOG_ID: u64 = 0x1_0000_0000 / WAL_SEGMENT_SIZE;
/// WAL segments per delta group.
pub const WAL_FILE_IN_DELTA: u64 = 16;

pub const DELTA_FILENAME_SUFFIX: &str = "_delta";
pub const PART_FILENAME_SUFFIX: &str = "_part";
pub const BACKUP_HISTORY_SUFFIX: &str = ".backup";

const WAL_FILENAME_LEN: usize = 24;

/// Log sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Parse the `X/X` form printed by the server.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || Error::Cli(format!("invalid LSN: {raw}"));
        let (hi, lo) = raw.split_once('/').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Self(((hi as u64) << 32) | lo as u64))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

/// Sequential number of a WAL segment within a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WalSegmentNo(pub u64);

impl WalSegmentNo {
    pub fn from_lsn(lsn: Lsn) -> Self {
        Self(lsn.0 / WAL_SEGMENT_SIZE)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn add(self, n: u64) -> Self {
        Self(self.0 + n)
    }

    /// Slot of this segment within its delta group.
    pub fn position_in_delta(self) -> usize {
        (self.0 % WAL_FILE_IN_DELTA) as usize
    }

    pub fn delta_no(self) -> DeltaNo {
        DeltaNo(self.0 / WAL_FILE_IN_DELTA * WAL_FILE_IN_DELTA)
    }

    /// `TTTTTTTTXXXXXXXXYYYYYYYY` segment file name.
    pub fn filename(self, timeline: u32) -> String {
        format!(
            "{:08X}{:08X}{:08X}",
            timeline,
            self.0 / SEGMENTS_PER_XLOG_ID,
            self.0 % SEGMENTS_PER_XLOG_ID
        )
    }
}

/// Number of the first segment of a delta group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeltaNo(pub u64);

impl DeltaNo {
    pub fn from_lsn(lsn: Lsn) -> Self {
        WalSegmentNo::from_lsn(lsn).delta_no()
    }

    pub fn next(self) -> Self {
        Self(self.0 + WAL_FILE_IN_DELTA)
    }

    pub fn previous(self) -> Self {
        Self(self.0.saturating_sub(WAL_FILE_IN_DELTA))
    }

    pub fn first_wal_segment_no(self) -> WalSegmentNo {
        WalSegmentNo(self.0)
    }

    pub fn filename(self, timeline: u32) -> String {
        format!("{}{}", self.first_wal_segment_no().filename(timeline), DELTA_FILENAME_SUFFIX)
    }
}

/// Split a WAL segment file name into timeline and segment number.
pub fn parse_wal_filename(name: &str) -> Result<(u32, WalSegmentNo)> {
    let invalid = || Error::InvalidWalFilename(name.to_string());
    if name.len() != WAL_FILENAME_LEN || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid().into());
    }
    let timeline = u32::from_str_radix(&name[0..8], 16).map_err(|_| invalid())?;
    let log_id = u64::from_str_radix(&name[8..16], 16).map_err(|_| invalid())?;
    let seg = u64::from_str_radix(&name[16..24], 16).map_err(|_| invalid())?;
    if seg >= SEGMENTS_PER_XLOG_ID {
        return Err(invalid().into());
    }
    Ok((timeline, WalSegmentNo(log_id * SEGMENTS_PER_XLOG_ID + seg)))
}

/// Name of the delta file recording the group containing `wal_filename`.
pub fn delta_filename_for(wal_filename: &str) -> Result<String> {
    let (timeline, segment) = parse_wal_filename(wal_filename)?;
    Ok(segment.delta_no().filename(timeline))
}

pub fn next_wal_filename(wal_filename: &str) -> Result<String> {
    let (timeline, segment) = parse_wal_filename(wal_filename)?;
    Ok(segment.next().filename(timeline))
}

pub fn position_in_delta(wal_filename: &str) -> Result<usize> {
    let (_, segment) = parse_wal_filename(wal_filename)?;
    Ok(segment.position_in_delta())
}

/// Whether `name` is a backup history file
/// (`TTTTTTTTXXXXXXXXYYYYYYYY.OOOOOOOO.backup`).
pub fn is_backup_history_filename(name: &str) -> bool {
    wal_filename_from_backup_history(name).is_ok()
}

/// Segment a backup history file was written for.
pub fn wal_filename_from_backup_history(name: &str) -> Result<String> {
    let invalid = || Error::InvalidWalFilename(name.to_string());
    let stem = name.strip_suffix(BACKUP_HISTORY_SUFFIX).ok_or_else(invalid)?;
    let (wal_filename, offset) = stem.split_once('.').ok_or_else(invalid)?;
    if offset.len() != 8 || !offset.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid().into());
    }
    parse_wal_filename(wal_filename)?;
    Ok(wal_filename.to_string())
}

pub fn to_part_filename(delta_filename: &str) -> String {
    format!("{delta_filename}{PART_FILENAME_SUFFIX}")
}

pub fn part_filename_to_delta(part_filename: &str) -> String {
    part_filename
        .strip_suffix(PART_FILENAME_SUFFIX)
        .unwrap_or(part_filename)
        .to_string()
}
