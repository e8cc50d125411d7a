//! Changed-block map keyed by relation.

use std::{collections::HashMap, path::Path};

use roaring::RoaringBitmap;

use crate::{
    relfile::{rel_file_node_from_path, rel_file_segment_no, BlockLocation, RelFileNode, BLOCKS_IN_REL_FILE},
    Error, Result,
};

/// Relation -> set of absolute changed block numbers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaMap {
    relations: HashMap<RelFileNode, RoaringBitmap>,
}

impl DeltaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_location(&mut self, location: BlockLocation) {
        self.relations
            .entry(location.rel)
            .or_default()
            .insert(location.block_no);
    }

    pub fn add_locations<I>(&mut self, locations: I)
    where
        I: IntoIterator<Item = BlockLocation>,
    {
        for location in locations {
            self.add_location(location);
        }
    }

    /// Union another map into this one.
    pub fn merge(&mut self, other: &DeltaMap) {
        for (rel, bitmap) in &other.relations {
            *self.relations.entry(*rel).or_default() |= bitmap;
        }
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn relation(&self, rel: &RelFileNode) -> Option<&RoaringBitmap> {
        self.relations.get(rel)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RelFileNode, &RoaringBitmap)> {
        self.relations.iter()
    }

    /// Changed blocks of the segment file at `path`, re-based to that
    /// segment. [`Error::NoBitmapFound`] when the relation never changed.
    pub fn delta_bitmap_for(&self, path: &Path) -> Result<RoaringBitmap> {
        let rel = rel_file_node_from_path(path)?;
        let bitmap = self
            .relations
            .get(&rel)
            .ok_or_else(|| Error::NoBitmapFound(path.display().to_string()))?;
        let segment = rel_file_segment_no(path)?;
        Ok(select_rel_file_blocks(bitmap, segment))
    }
}

impl Extend<BlockLocation> for DeltaMap {
    fn extend<T: IntoIterator<Item = BlockLocation>>(&mut self, iter: T) {
        self.add_locations(iter);
    }
}

impl FromIterator<BlockLocation> for DeltaMap {
    fn from_iter<T: IntoIterator<Item = BlockLocation>>(iter: T) -> Self {
        let mut map = DeltaMap::new();
        map.add_locations(iter);
        map
    }
}

/// Blocks of segment `segment` shifted down to segment-local numbering.
pub fn select_rel_file_blocks(bitmap: &RoaringBitmap, segment: u32) -> RoaringBitmap {
    let start = segment as u64 * BLOCKS_IN_REL_FILE as u64;
    if start > u32::MAX as u64 {
        return RoaringBitmap::new();
    }
    let last = start + BLOCKS_IN_REL_FILE as u64 - 1;
    let mut range = RoaringBitmap::new();
    range.insert_range(start as u32..=last as u32);
    let selected = bitmap & &range;
    selected
        .iter()
        .map(|block| block - start as u32)
        .collect()
}
