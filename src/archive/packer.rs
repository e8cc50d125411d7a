//! Packs one file into an archive part, in full or as an increment.

use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use anyhow::Context;
use tar::Header;
use tracing::{debug, warn};

use crate::{
    delta::DeltaMap,
    limit::DiskLimiter,
    logging::PackingSnapshot,
    page::{read_incremental_file, verify_paged_file, verify_pages},
    relfile::{is_paged_file, rel_file_segment_no, BLOCKS_IN_REL_FILE},
    Error, Result,
};

use super::{files::BundleFiles, tar_ball::TarBall};

/// What the composer knows about a file before it is packed.
#[derive(Debug, Clone)]
pub struct ComposeFileInfo {
    /// Location on disk.
    pub path: PathBuf,
    /// Member name inside the backup, relative to the data directory.
    pub name: String,
    pub size: u64,
    pub mtime: SystemTime,
    pub was_in_base: bool,
    pub is_incremented: bool,
    pub header: Header,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackerOptions {
    pub verify_page_checksums: bool,
    pub store_all_corrupt_blocks: bool,
}

/// Counters shared by every packer of one backup run.
#[derive(Debug, Default)]
pub struct PackingStats {
    files_packed: AtomicU64,
    files_incremented: AtomicU64,
    files_skipped: AtomicU64,
    invalid_page_fallbacks: AtomicU64,
    corrupt_blocks: AtomicU64,
    bytes_packed: AtomicU64,
}

impl PackingStats {
    pub fn snapshot(&self, tar_balls_uploaded: u64) -> PackingSnapshot {
        PackingSnapshot {
            files_packed: self.files_packed.load(Ordering::Relaxed),
            files_incremented: self.files_incremented.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            invalid_page_fallbacks: self.invalid_page_fallbacks.load(Ordering::Relaxed),
            corrupt_blocks: self.corrupt_blocks.load(Ordering::Relaxed),
            bytes_packed: self.bytes_packed.load(Ordering::Relaxed),
            tar_balls_uploaded,
        }
    }

    pub fn record_skipped(&self) {
        self.files_skipped.fetch_add(1, Ordering::Relaxed);
    }
}

enum FileSource {
    /// Unchanged since the delta map was built; the base backup has it.
    Skipped,
    /// Removed while the backup was running.
    Missing,
    Contents {
        reader: Box<dyn Read + Send>,
        size: u64,
        /// Segment-local blocks carried by an increment.
        increment_blocks: Option<Vec<u32>>,
    },
}

/// Turns files into archive members.
#[derive(Debug, Clone)]
pub struct TarBallFilePacker {
    delta_map: Option<Arc<DeltaMap>>,
    increment_from_lsn: Option<u64>,
    files: Arc<BundleFiles>,
    options: PackerOptions,
    limiter: DiskLimiter,
    stats: Arc<PackingStats>,
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>()
        .map(|e| e.kind() == io::ErrorKind::NotFound)
        .unwrap_or(false)
}

impl TarBallFilePacker {
    pub fn new(
        delta_map: Option<Arc<DeltaMap>>,
        increment_from_lsn: Option<u64>,
        files: Arc<BundleFiles>,
        options: PackerOptions,
        limiter: DiskLimiter,
        stats: Arc<PackingStats>,
    ) -> Self {
        Self {
            delta_map,
            increment_from_lsn,
            files,
            options,
            limiter,
            stats,
        }
    }

    pub fn update_delta_map(&mut self, delta_map: Option<Arc<DeltaMap>>) {
        self.delta_map = delta_map;
    }

    pub fn files(&self) -> &Arc<BundleFiles> {
        &self.files
    }

    pub fn stats(&self) -> &Arc<PackingStats> {
        &self.stats
    }

    /// Write `info` into `tar_ball`.
    ///
    /// Files without recorded changes are marked skipped, files removed
    /// during the backup are ignored, and increments over unreadable pages
    /// fall back to full copies. Every other failure is returned. Returns
    /// whether a member was written.
    pub fn pack_file_into_tar(&self, info: &mut ComposeFileInfo, tar_ball: &mut dyn TarBall) -> Result<bool> {
        let (mut reader, size, increment_blocks) = match self.open_file(info)? {
            FileSource::Skipped => {
                debug!(file = %info.name, "no changes recorded, skipping");
                self.files.add_skipped_file(&info.name, info.mtime);
                self.stats.record_skipped();
                return Ok(false);
            }
            FileSource::Missing => {
                warn!(
                    path = %info.path.display(),
                    "file does not exist, probably deleted during the backup"
                );
                return Ok(false);
            }
            FileSource::Contents {
                reader,
                size,
                increment_blocks,
            } => (reader, size, increment_blocks),
        };

        if self.options.verify_page_checksums {
            let corrupt = self.verify(info, increment_blocks.as_deref())?;
            self.stats
                .corrupt_blocks
                .fetch_add(corrupt.len() as u64, Ordering::Relaxed);
            self.files.add_file_with_corrupt_blocks(
                &info.name,
                info.mtime,
                info.is_incremented,
                corrupt,
                self.options.store_all_corrupt_blocks,
            );
        } else {
            self.files.add_file(&info.name, info.mtime, info.is_incremented);
        }

        info.header.set_size(size);
        let packed = tar_ball
            .append(&info.name, &mut info.header, &mut reader)
            .with_context(|| format!("packing {} into {}", info.name, tar_ball.name()))?;
        if packed != size {
            return Err(Error::TarSize {
                packed,
                declared: size,
            }
            .into());
        }

        self.stats.files_packed.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_packed.fetch_add(packed, Ordering::Relaxed);
        if info.is_incremented {
            self.stats.files_incremented.fetch_add(1, Ordering::Relaxed);
        }
        Ok(true)
    }

    fn open_file(&self, info: &mut ComposeFileInfo) -> Result<FileSource> {
        let base_lsn = match self.increment_from_lsn {
            Some(lsn) if info.is_incremented => lsn,
            _ => {
                info.is_incremented = false;
                return self.open_full(info);
            }
        };

        let bitmap = match &self.delta_map {
            None => None,
            Some(map) => match map.delta_bitmap_for(&info.path) {
                Ok(bitmap) => Some(bitmap),
                Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::NoBitmapFound(_))) => {
                    return Ok(FileSource::Skipped)
                }
                Err(err) => {
                    return Err(err.context(format!("finding changed blocks of {}", info.path.display())))
                }
            },
        };

        match read_incremental_file(&info.path, info.size, base_lsn, bitmap.as_ref(), &self.limiter) {
            Ok((reader, size)) => {
                let blocks = reader.header().blocks.clone();
                Ok(FileSource::Contents {
                    reader: Box::new(reader.chain(io::repeat(0)).take(size)),
                    size,
                    increment_blocks: Some(blocks),
                })
            }
            Err(err) if is_not_found(&err) => Ok(FileSource::Missing),
            Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::InvalidBlock { .. })) => {
                warn!(
                    file = %info.name,
                    error = %format!("{err:#}"),
                    "failed to read file as incremented, storing it in full"
                );
                self.stats
                    .invalid_page_fallbacks
                    .fetch_add(1, Ordering::Relaxed);
                info.is_incremented = false;
                self.open_full(info)
            }
            Err(err) => Err(err.context(format!("reading incremental file {}", info.path.display()))),
        }
    }

    fn open_full(&self, info: &ComposeFileInfo) -> Result<FileSource> {
        let file = match File::open(&info.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileSource::Missing),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("opening {}", info.path.display())))
            }
        };
        // Shrunk files are padded with zeros, grown files are cut at the
        // size seen by the walk.
        let reader = self
            .limiter
            .reader(file)
            .chain(io::repeat(0))
            .take(info.size);
        Ok(FileSource::Contents {
            reader: Box::new(reader),
            size: info.size,
            increment_blocks: None,
        })
    }

    /// Absolute numbers of corrupt blocks among the pages being stored.
    fn verify(&self, info: &ComposeFileInfo, increment_blocks: Option<&[u32]>) -> Result<Vec<u32>> {
        if !is_verifiable(&info.path) {
            return Ok(Vec::new());
        }
        let file = match File::open(&info.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let local = match increment_blocks {
            Some(blocks) => verify_pages(&info.path, &file, blocks)?,
            None => verify_paged_file(&info.path, &file, info.size)?,
        };
        let offset = rel_file_segment_no(&info.path).unwrap_or(0) * BLOCKS_IN_REL_FILE;
        Ok(local.into_iter().map(|b| b + offset).collect())
    }
}

fn is_verifiable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| is_paged_file(&meta, path))
        .unwrap_or(false)
}
