use std::{collections::HashMap, path::PathBuf, time::SystemTime};

use pgdelta::{
    archive::{
        compose_files, BackupFileDescription, ComposeFileInfo, ComposeRatingEvaluator,
        CorruptBlocksInfo, DefaultComposeRatingEvaluator, RatedComposeFileInfo,
        RelFileStatistics, RelationStat, MAX_CORRUPT_BLOCKS_TO_STORE,
    },
    relfile::RelFileNode,
};
use tar::Header;

fn rated(name: &str, rating: u64, expected_size: u64) -> RatedComposeFileInfo {
    RatedComposeFileInfo {
        info: ComposeFileInfo {
            path: PathBuf::from("/pgdata").join(name),
            name: name.to_string(),
            size: expected_size,
            mtime: SystemTime::UNIX_EPOCH,
            was_in_base: true,
            is_incremented: false,
            header: Header::new_gnu(),
        },
        update_rating: rating,
        updates_count: rating,
        expected_size,
    }
}

fn names(collection: &pgdelta::archive::TarFilesCollection) -> Vec<&str> {
    collection.files.iter().map(|f| f.info.name.as_str()).collect()
}

fn described(updates_count: u64) -> BackupFileDescription {
    let mut description = BackupFileDescription::new(true, false, SystemTime::UNIX_EPOCH);
    description.updates_count = updates_count;
    description
}

#[test]
fn files_are_ordered_by_rating() {
    let collections = compose_files(
        vec![rated("hot", 0, 10), rated("cold", 0, 10), rated("warm", 0, 10)],
        1000,
    );
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0].expected_size, 30);
    assert_eq!(names(&collections[0]).len(), 3);

    let collections = compose_files(
        vec![rated("hot", 90, 10), rated("cold", 5, 10), rated("warm", 40, 10)],
        1000,
    );
    assert_eq!(collections.len(), 1);
    assert_eq!(names(&collections[0]), vec!["cold", "warm", "hot"]);
}

#[test]
fn unchanged_files_get_their_own_collection() {
    let collections = compose_files(
        vec![
            rated("base/5/1", 3, 100),
            rated("base/5/2", 0, 100),
            rated("base/5/3", 0, 100),
            rated("base/5/4", 7, 100),
        ],
        10_000,
    );
    assert_eq!(collections.len(), 2);
    assert_eq!(names(&collections[0]).len(), 2);
    assert!(collections[0].files.iter().all(|f| f.update_rating == 0));
    assert_eq!(names(&collections[1]), vec!["base/5/1", "base/5/4"]);
}

#[test]
fn collection_is_cut_once_over_threshold() {
    let collections = compose_files(
        vec![
            rated("a", 1, 60),
            rated("b", 2, 60),
            rated("c", 3, 60),
            rated("d", 4, 60),
        ],
        100,
    );
    let sizes: Vec<u64> = collections.iter().map(|c| c.expected_size).collect();
    assert_eq!(sizes, vec![120, 120]);
    assert_eq!(names(&collections[0]), vec!["a", "b"]);
    assert_eq!(names(&collections[1]), vec!["c", "d"]);
}

#[test]
fn nothing_to_compose_gives_no_collections() {
    assert!(compose_files(Vec::new(), 100).is_empty());
    let collections = compose_files(vec![rated("only", 9, 1)], 100);
    assert_eq!(collections.len(), 1);
}

#[test]
fn rating_is_growth_against_the_base() {
    let base: HashMap<String, BackupFileDescription> = [
        ("base/5/100".to_string(), described(50)),
        ("base/5/200".to_string(), described(0)),
    ]
    .into_iter()
    .collect();
    let evaluator = DefaultComposeRatingEvaluator::new(base);

    assert_eq!(evaluator.evaluate("base/5/100", 25, true), 50);
    assert_eq!(evaluator.evaluate("base/5/100", 100, true), 200);
    assert_eq!(evaluator.evaluate("base/5/200", 7, true), 7);
    assert_eq!(evaluator.evaluate("base/5/300", 4, true), 4);
    assert_eq!(evaluator.evaluate("base/5/100", 25, false), 25);
}

#[test]
fn update_count_sums_relation_counters() {
    let mut stats = RelFileStatistics::new();
    stats.insert(
        RelFileNode::new(1663, 5, 100),
        RelationStat {
            inserted: 2,
            updated: 3,
            deleted: 1,
        },
    );
    assert_eq!(stats.file_update_count("base/5/100"), 6);
    assert_eq!(stats.file_update_count("base/5/100.2"), 6);
    assert_eq!(stats.file_update_count("base/5/100_fsm"), 0);
    assert_eq!(stats.file_update_count("base/6/100"), 0);
}

#[test]
fn corrupt_block_list_is_bounded() {
    assert_eq!(CorruptBlocksInfo::new(Vec::new(), false), None);

    let blocks: Vec<u32> = (0..25).collect();
    let bounded = CorruptBlocksInfo::new(blocks.clone(), false).unwrap();
    assert_eq!(bounded.count, 25);
    assert_eq!(bounded.some_blocks.len(), MAX_CORRUPT_BLOCKS_TO_STORE);

    let full = CorruptBlocksInfo::new(blocks.clone(), true).unwrap();
    assert_eq!(full.some_blocks, blocks);
}
