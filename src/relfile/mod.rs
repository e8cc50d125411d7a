//! Relation file identity derived from data directory paths.
//!
//! A relation is stored as a chain of 1 GiB segment files named
//! `<relnode>`, `<relnode>.1`, `<relnode>.2`, ... under either
//! `base/<db>/` (default tablespace) or
//! `pg_tblspc/<spc>/<version dir>/<db>/` (explicit tablespace).

use std::{
    fmt,
    fs::Metadata,
    path::{Component, Path},
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{page::PAGE_SIZE, Error, Result};

/// Largest on-disk segment of a relation.
pub const REL_FILE_SIZE_BOUND: u64 = 1 << 30;
/// Pages per relation segment file.
pub const BLOCKS_IN_REL_FILE: u32 = (REL_FILE_SIZE_BOUND / PAGE_SIZE as u64) as u32;
/// OID of `pg_default`.
pub const DEFAULT_SPC_NODE: u32 = 1663;

pub const DEFAULT_TABLESPACE: &str = "base";
pub const GLOBAL_TABLESPACE: &str = "global";
pub const NON_DEFAULT_TABLESPACE: &str = "pg_tblspc";

static PAGED_FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)([.]\d+)?$").expect("paged filename pattern is valid")
});

/// `RelFileNode`: tablespace, database, and relation OIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct RelFileNode {
    pub spc_node: u32,
    pub db_node: u32,
    pub rel_node: u32,
}

impl RelFileNode {
    pub fn new(spc_node: u32, db_node: u32, rel_node: u32) -> Self {
        Self {
            spc_node,
            db_node,
            rel_node,
        }
    }
}

impl fmt::Display for RelFileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spc_node, self.db_node, self.rel_node)
    }
}

/// One changed page of a relation. Block numbers are absolute across
/// segment files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BlockLocation {
    pub rel: RelFileNode,
    pub block_no: u32,
}

impl BlockLocation {
    pub fn new(spc_node: u32, db_node: u32, rel_node: u32, block_no: u32) -> Self {
        Self {
            rel: RelFileNode::new(spc_node, db_node, rel_node),
            block_no,
        }
    }

    /// Encoded width on disk: four little-endian u32 values.
    pub const ENCODED_LEN: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.rel.spc_node.to_le_bytes());
        out[4..8].copy_from_slice(&self.rel.db_node.to_le_bytes());
        out[8..12].copy_from_slice(&self.rel.rel_node.to_le_bytes());
        out[12..16].copy_from_slice(&self.block_no.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; Self::ENCODED_LEN]) -> Self {
        let u32_at = |off: usize| u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]]);
        Self::new(u32_at(0), u32_at(4), u32_at(8), u32_at(12))
    }

    /// The all-zero location terminating a serialized location list.
    pub fn is_terminator(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for BlockLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.rel, self.block_no)
    }
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidRelFilePath(path.display().to_string()).into())
}

/// Whether `name` looks like a relation segment file (`123` or `123.4`).
pub fn is_paged_filename(name: &str) -> bool {
    PAGED_FILENAME.is_match(name)
}

/// Segment index of a relation file: `0` for `<rel>`, `N` for `<rel>.N`.
pub fn rel_file_segment_no(path: &Path) -> Result<u32> {
    let name = file_name(path)?;
    let caps = PAGED_FILENAME
        .captures(name)
        .ok_or_else(|| Error::InvalidRelFilePath(path.display().to_string()))?;
    match caps.get(2) {
        None => Ok(0),
        Some(suffix) => suffix.as_str()[1..]
            .parse::<u32>()
            .map_err(|_| Error::InvalidRelFilePath(path.display().to_string()).into()),
    }
}

/// Derive the relation identity of a data file from its path.
pub fn rel_file_node_from_path(path: &Path) -> Result<RelFileNode> {
    let invalid = || Error::InvalidRelFilePath(path.display().to_string());
    let name = file_name(path)?;
    let caps = PAGED_FILENAME.captures(name).ok_or_else(invalid)?;
    let rel_node: u32 = caps[1].parse().map_err(|_| invalid())?;

    let dirs: Vec<&str> = path
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    Component::Normal(s) => s.to_str(),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let db_node: u32 = dirs
        .last()
        .and_then(|d| d.parse().ok())
        .ok_or_else(invalid)?;

    // The tablespace marker closest to the file wins.
    let marker = dirs
        .iter()
        .rposition(|d| *d == DEFAULT_TABLESPACE || *d == NON_DEFAULT_TABLESPACE);

    match marker.map(|idx| dirs[idx]) {
        Some(DEFAULT_TABLESPACE) => Ok(RelFileNode::new(DEFAULT_SPC_NODE, db_node, rel_node)),
        Some(_) => {
            if dirs.len() < 3 {
                return Err(invalid().into());
            }
            let spc_node: u32 = dirs[dirs.len() - 3].parse().map_err(|_| invalid())?;
            Ok(RelFileNode::new(spc_node, db_node, rel_node))
        }
        None => Err(Error::UnknownTablespace(path.display().to_string()).into()),
    }
}

/// Basic expectations for a file that can be backed up page by page.
pub fn is_paged_file(meta: &Metadata, path: &Path) -> bool {
    if meta.is_dir() || meta.len() == 0 || meta.len() % PAGE_SIZE as u64 != 0 {
        return false;
    }
    let in_tablespace = path.components().any(|c| {
        matches!(c, Component::Normal(s) if s == DEFAULT_TABLESPACE || s == NON_DEFAULT_TABLESPACE)
    });
    in_tablespace
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .map(is_paged_filename)
            .unwrap_or(false)
}
