//! Per-file manifest entries and per-part file lists produced while packing.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
    time::SystemTime,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    delta::DeltaMap,
    relfile::{rel_file_node_from_path, RelFileNode},
};

/// Corrupt block numbers kept in a file description unless all are requested.
pub const MAX_CORRUPT_BLOCKS_TO_STORE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptBlocksInfo {
    pub count: usize,
    pub some_blocks: Vec<u32>,
}

impl CorruptBlocksInfo {
    /// `None` when there is nothing to report.
    pub fn new(mut blocks: Vec<u32>, store_all: bool) -> Option<Self> {
        if blocks.is_empty() {
            return None;
        }
        let count = blocks.len();
        if !store_all {
            blocks.truncate(MAX_CORRUPT_BLOCKS_TO_STORE);
        }
        Some(Self {
            count,
            some_blocks: blocks,
        })
    }
}

/// Manifest entry of one archived file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFileDescription {
    pub is_incremented: bool,
    pub is_skipped: bool,
    pub mtime: SystemTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrupt_blocks: Option<CorruptBlocksInfo>,
    #[serde(default)]
    pub updates_count: u64,
}

impl BackupFileDescription {
    pub fn new(is_incremented: bool, is_skipped: bool, mtime: SystemTime) -> Self {
        Self {
            is_incremented,
            is_skipped,
            mtime,
            corrupt_blocks: None,
            updates_count: 0,
        }
    }

    pub fn set_corrupt_blocks(&mut self, blocks: Vec<u32>, store_all: bool) {
        self.corrupt_blocks = CorruptBlocksInfo::new(blocks, store_all);
    }
}

/// Tuple change counters of one relation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelationStat {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl RelationStat {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// Change counters per relation, consulted for `updates_count`.
#[derive(Debug, Clone, Default)]
pub struct RelFileStatistics {
    stats: HashMap<RelFileNode, RelationStat>,
}

impl RelFileStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rel: RelFileNode, stat: RelationStat) {
        self.stats.insert(rel, stat);
    }

    /// Use the number of changed blocks of each relation as its update count.
    pub fn from_delta_map(map: &DeltaMap) -> Self {
        let stats = map
            .iter()
            .map(|(rel, bitmap)| {
                (
                    *rel,
                    RelationStat {
                        updated: bitmap.len(),
                        ..RelationStat::default()
                    },
                )
            })
            .collect();
        Self { stats }
    }

    /// Updates of the relation `path` belongs to; 0 for anything else.
    pub fn file_update_count(&self, path: &str) -> u64 {
        rel_file_node_from_path(Path::new(path))
            .ok()
            .and_then(|rel| self.stats.get(&rel))
            .map(RelationStat::total)
            .unwrap_or(0)
    }
}

/// Concurrent manifest of the backup being created, keyed by member name.
#[derive(Debug, Default)]
pub struct BundleFiles {
    files: DashMap<String, BackupFileDescription>,
    stats: Option<Arc<RelFileStatistics>>,
}

impl BundleFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill `updates_count` of every added entry from `stats`.
    pub fn with_statistics(stats: Arc<RelFileStatistics>) -> Self {
        Self {
            files: DashMap::new(),
            stats: Some(stats),
        }
    }

    fn updates_count(&self, name: &str) -> u64 {
        self.stats
            .as_ref()
            .map(|s| s.file_update_count(name))
            .unwrap_or(0)
    }

    pub fn add_skipped_file(&self, name: &str, mtime: SystemTime) {
        let mut description = BackupFileDescription::new(false, true, mtime);
        description.updates_count = self.updates_count(name);
        self.add_file_description(name, description);
    }

    pub fn add_file(&self, name: &str, mtime: SystemTime, is_incremented: bool) {
        let mut description = BackupFileDescription::new(is_incremented, false, mtime);
        description.updates_count = self.updates_count(name);
        self.add_file_description(name, description);
    }

    pub fn add_file_with_corrupt_blocks(
        &self,
        name: &str,
        mtime: SystemTime,
        is_incremented: bool,
        corrupt_blocks: Vec<u32>,
        store_all: bool,
    ) {
        let mut description = BackupFileDescription::new(is_incremented, false, mtime);
        description.updates_count = self.updates_count(name);
        description.set_corrupt_blocks(corrupt_blocks, store_all);
        self.add_file_description(name, description);
    }

    pub fn add_file_description(&self, name: &str, description: BackupFileDescription) {
        self.files.insert(name.to_string(), description);
    }

    pub fn get(&self, name: &str) -> Option<BackupFileDescription> {
        self.files.get(name).map(|d| d.value().clone())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Sorted copy, ready for serialization into the backup manifest.
    pub fn to_map(&self) -> BTreeMap<String, BackupFileDescription> {
        self.files
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

/// Archive part name to the member names written into it.
#[derive(Debug, Default)]
pub struct TarFileSets {
    sets: Mutex<BTreeMap<String, Vec<String>>>,
}

impl TarFileSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(sets: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            sets: Mutex::new(sets),
        }
    }

    pub fn add_file(&self, part: &str, name: &str) {
        self.sets
            .lock()
            .entry(part.to_string())
            .or_default()
            .push(name.to_string());
    }

    pub fn add_files<I>(&self, part: &str, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.sets
            .lock()
            .entry(part.to_string())
            .or_default()
            .extend(names);
    }

    pub fn get(&self, part: &str) -> Option<Vec<String>> {
        self.sets.lock().get(part).cloned()
    }

    pub fn to_map(&self) -> BTreeMap<String, Vec<String>> {
        self.sets.lock().clone()
    }
}

/// Ordering key used by the rating composer.
pub trait ComposeRatingEvaluator: Send + Sync {
    fn evaluate(&self, name: &str, updates_count: u64, was_in_base: bool) -> u64;
}

/// Rates a file by how its update count grew relative to the base backup:
/// `updates * 100 / previous`, or the raw count when the file is new to the
/// backup chain or had no recorded updates.
#[derive(Debug, Clone, Default)]
pub struct DefaultComposeRatingEvaluator {
    base_files: HashMap<String, BackupFileDescription>,
}

impl DefaultComposeRatingEvaluator {
    pub fn new(base_files: HashMap<String, BackupFileDescription>) -> Self {
        Self { base_files }
    }
}

impl ComposeRatingEvaluator for DefaultComposeRatingEvaluator {
    fn evaluate(&self, name: &str, updates_count: u64, was_in_base: bool) -> u64 {
        if !was_in_base {
            return updates_count;
        }
        match self.base_files.get(name).map(|d| d.updates_count) {
            Some(previous) if previous > 0 => updates_count.saturating_mul(100) / previous,
            _ => updates_count,
        }
    }
}
