//! Composer grouping files with a similar update rating into the same part.
//!
//! Files are collected first, rated, sorted by rating and cut into
//! collections bounded by their expected packed size. Rarely updated files
//! end up together, so a restore from a long chain touches fewer parts.

use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::SystemTime,
};

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use tar::Header;
use tracing::{debug, info, warn};

use crate::{
    delta::DeltaMap,
    page::{encoded_increment_size, read_increment_locations},
    Error, Result,
};

use super::{
    composer::{FileWorkerPool, TarBallComposer},
    files::{BundleFiles, ComposeRatingEvaluator, RelFileStatistics, TarFileSets},
    packer::{ComposeFileInfo, TarBallFilePacker},
    queue::TarBallQueue,
};

#[derive(Debug, Clone)]
pub struct RatedComposeFileInfo {
    pub info: ComposeFileInfo,
    pub update_rating: u64,
    pub updates_count: u64,
    /// On-disk size for full copies, estimated increment size otherwise.
    pub expected_size: u64,
}

/// Files destined for one archive part.
#[derive(Debug, Default)]
pub struct TarFilesCollection {
    pub files: Vec<RatedComposeFileInfo>,
    pub expected_size: u64,
}

impl TarFilesCollection {
    pub fn add_file(&mut self, file: RatedComposeFileInfo) {
        self.expected_size += file.expected_size;
        self.files.push(file);
    }
}

/// Sort by rating and cut into collections. A new collection starts once
/// the current one exceeds `tar_size_threshold`, and where ratings turn
/// from zero to non-zero. Empty collections are dropped.
pub fn compose_files(mut files: Vec<RatedComposeFileInfo>, tar_size_threshold: u64) -> Vec<TarFilesCollection> {
    files.sort_by_key(|f| f.update_rating);
    let mut collections = Vec::new();
    let mut current = TarFilesCollection::default();
    let mut prev_rating = 0;
    for file in files {
        if current.expected_size > tar_size_threshold || (prev_rating == 0 && file.update_rating > 0) {
            collections.push(std::mem::take(&mut current));
        }
        prev_rating = file.update_rating;
        current.add_file(file);
    }
    collections.push(current);
    collections.retain(|c| !c.files.is_empty());
    collections
}

struct RatingState {
    evaluator: Arc<dyn ComposeRatingEvaluator>,
    stats: Arc<RelFileStatistics>,
    increment_base_lsn: Option<u64>,
    delta_map: RwLock<DeltaMap>,
    delta_map_complete: bool,
    files_to_compose: Mutex<Vec<RatedComposeFileInfo>>,
}

impl RatingState {
    fn add_file(&self, mut info: ComposeFileInfo) -> Result<()> {
        let expected_size = self.expected_file_size(&mut info)?;
        let updates_count = self.stats.file_update_count(&info.name);
        let update_rating = self
            .evaluator
            .evaluate(&info.name, updates_count, info.was_in_base);
        self.files_to_compose.lock().push(RatedComposeFileInfo {
            info,
            update_rating,
            updates_count,
            expected_size,
        });
        Ok(())
    }

    fn expected_file_size(&self, info: &mut ComposeFileInfo) -> Result<u64> {
        if !info.is_incremented {
            return Ok(info.size);
        }
        if !self.delta_map_complete {
            let Some(lsn) = self.increment_base_lsn else {
                return Ok(info.size);
            };
            match read_increment_locations(&info.path, info.size, lsn) {
                Ok(locations) => self.delta_map.write().add_locations(locations),
                // Unreadable pages: the file is stored in full.
                Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::InvalidBlock { .. })) => {
                    warn!(
                        file = %info.name,
                        error = %format!("{err:#}"),
                        "failed to scan file for changed pages, storing it in full"
                    );
                    info.is_incremented = false;
                    return Ok(info.size);
                }
                Err(err)
                    if err
                        .downcast_ref::<io::Error>()
                        .map(|e| e.kind() == io::ErrorKind::NotFound)
                        .unwrap_or(false) =>
                {
                    return Ok(0)
                }
                Err(err) => {
                    return Err(err.context(format!("scanning changed pages of {}", info.path.display())))
                }
            }
        }
        match self.delta_map.read().delta_bitmap_for(&info.path) {
            Ok(bitmap) => Ok(encoded_increment_size(bitmap.len())),
            // Skipped by the packer, nothing lands in the part.
            Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::NoBitmapFound(_))) => Ok(0),
            Err(err) => Err(err.context(format!("finding changed blocks of {}", info.path.display()))),
        }
    }
}

pub struct RatingTarBallComposer {
    state: Arc<RatingState>,
    pool: FileWorkerPool,
    headers: Mutex<Vec<(String, Header)>>,
    queue: Arc<TarBallQueue>,
    packer: TarBallFilePacker,
    files: Arc<BundleFiles>,
}

impl std::fmt::Debug for RatingTarBallComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatingTarBallComposer")
            .field("queue", &self.queue)
            .field("delta_map_complete", &self.state.delta_map_complete)
            .finish()
    }
}

impl RatingTarBallComposer {
    /// Without `delta_map` every incremented file is scanned to estimate its
    /// increment and the map is assembled from those scans.
    pub fn new(
        queue: Arc<TarBallQueue>,
        packer: TarBallFilePacker,
        evaluator: Arc<dyn ComposeRatingEvaluator>,
        stats: Arc<RelFileStatistics>,
        delta_map: Option<DeltaMap>,
        increment_base_lsn: Option<u64>,
    ) -> Self {
        let delta_map_complete = delta_map.is_some();
        let state = Arc::new(RatingState {
            evaluator,
            stats,
            increment_base_lsn,
            delta_map: RwLock::new(delta_map.unwrap_or_default()),
            delta_map_complete,
            files_to_compose: Mutex::new(Vec::new()),
        });
        let pool = {
            let state = Arc::clone(&state);
            FileWorkerPool::spawn(queue.parallelism(), Arc::new(move |info: ComposeFileInfo| state.add_file(info)))
        };
        let files = Arc::clone(packer.files());
        Self {
            state,
            pool,
            headers: Mutex::new(Vec::new()),
            queue,
            packer,
            files,
        }
    }

    fn write_headers(&self, tar_file_sets: &TarFileSets) -> Result<()> {
        let headers = std::mem::take(&mut *self.headers.lock());
        if headers.is_empty() {
            return Ok(());
        }
        let mut part = self.queue.deque()?;
        let mut names = Vec::with_capacity(headers.len());
        let mut written = Ok(());
        for (name, mut header) in headers {
            header.set_size(0);
            if let Err(err) = part.append(&name, &mut header, &mut io::empty()) {
                written = Err(err.context(format!("writing header of {name}")));
                break;
            }
            names.push(name);
        }
        tar_file_sets.add_files(part.name(), names);
        self.queue.enqueue_back(part);
        written
    }

    fn pack_collection(
        &self,
        collection: TarFilesCollection,
        tar_file_sets: &Arc<TarFileSets>,
        packer: &TarBallFilePacker,
    ) -> Result<JoinHandle<Result<()>>> {
        let mut part = self.queue.deque()?;
        let queue = Arc::clone(&self.queue);
        let tar_file_sets = Arc::clone(tar_file_sets);
        let packer = packer.clone();
        debug!(
            part = %part.name(),
            files = collection.files.len(),
            expected_size = collection.expected_size,
            "packing collection"
        );
        Ok(thread::spawn(move || {
            let mut packed = Ok(());
            for mut file in collection.files {
                match packer.pack_file_into_tar(&mut file.info, part.as_mut()) {
                    Ok(true) => tar_file_sets.add_file(part.name(), &file.info.name),
                    Ok(false) => {}
                    Err(err) => {
                        packed = Err(err);
                        break;
                    }
                }
            }
            match packed {
                Ok(()) => queue.finish_tar_ball(part),
                Err(err) => {
                    queue.enqueue_back(part);
                    Err(err)
                }
            }
        }))
    }
}

impl TarBallComposer for RatingTarBallComposer {
    fn add_file(&self, info: ComposeFileInfo) -> Result<()> {
        self.pool.submit(info)
    }

    fn add_header(&self, name: &str, header: Header, mtime: SystemTime) -> Result<()> {
        self.headers.lock().push((name.to_string(), header));
        self.files.add_file(name, mtime, false);
        Ok(())
    }

    fn skip_file(&self, name: &str, mtime: SystemTime) {
        self.files.add_skipped_file(name, mtime);
    }

    fn finish_composing(&self) -> Result<TarFileSets> {
        self.pool.finish().context("rating files")?;

        let delta_map = std::mem::take(&mut *self.state.delta_map.write());
        let mut packer = self.packer.clone();
        packer.update_delta_map(Some(Arc::new(delta_map)));

        let files = std::mem::take(&mut *self.state.files_to_compose.lock());
        let collections = compose_files(files, self.queue.tar_size_threshold());
        info!(collections = collections.len(), "composed tar file collections");

        let tar_file_sets = Arc::new(TarFileSets::new());
        self.write_headers(&tar_file_sets)?;

        let mut handles = Vec::with_capacity(collections.len());
        let mut result = Ok(());
        for collection in collections {
            match self.pack_collection(collection, &tar_file_sets, &packer) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        for handle in handles {
            let joined = handle.join().unwrap_or_else(|_| {
                Err(Error::TarBallClose {
                    name: "collection".into(),
                    reason: "packing thread panicked".into(),
                }
                .into())
            });
            if result.is_ok() {
                result = joined;
            }
        }
        result?;
        Ok(TarFileSets::from_map(tar_file_sets.to_map()))
    }

    fn files(&self) -> Arc<BundleFiles> {
        Arc::clone(&self.files)
    }
}
