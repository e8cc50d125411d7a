//! Change tracking derived from WAL.
//!
//! `map` holds the per-relation changed-block bitmaps consulted at backup
//! time. The remaining modules persist changes per delta group (16 WAL
//! segments) while WAL is archived, and rebuild a map from those files.

pub mod builder;
pub mod cache;
pub mod file;
pub mod manager;
pub mod map;
pub mod names;
pub mod part;
pub mod recorder;

pub use builder::{load_delta_map, WalSource};
pub use cache::LazyCache;
pub use file::DeltaFile;
pub use manager::{DeltaFileManager, DeltaFileWriter};
pub use map::{select_rel_file_blocks, DeltaMap};
pub use names::{
    delta_filename_for, is_backup_history_filename, next_wal_filename, part_filename_to_delta,
    position_in_delta, to_part_filename, wal_filename_from_backup_history, DeltaNo, Lsn,
    WalSegmentNo, WAL_FILE_IN_DELTA,
};
pub use part::WalPartFile;
pub use recorder::{WalDeltaRecorder, WalDeltaRecordingReader, WalPartRecorder};
