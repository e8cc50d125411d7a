//! Recording state for every delta group touched by WAL archiving.
//!
//! Each delta group gets one writer thread appending locations from a
//! bounded queue, and one part file collecting record fragments at segment
//! boundaries. Both are loaded lazily from the local data folder, so a
//! group recorded across several processes resumes where it stopped.

use std::{
    collections::HashSet,
    sync::{
        mpsc::{self, Receiver, Sender, SyncSender},
        Arc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{
    logging::{log_delta_flush, DeltaFlushSnapshot},
    relfile::BlockLocation,
    storage::{Folder, FsFolder, Uploader},
    wal::{ParserState, WalDecoder},
    Error, Result,
};

use super::{
    cache::LazyCache,
    file::DeltaFile,
    names::{
        delta_filename_for, next_wal_filename, part_filename_to_delta, to_part_filename,
        wal_filename_from_backup_history, BACKUP_HISTORY_SUFFIX,
    },
    part::WalPartFile,
};

/// Single-writer task owning one [`DeltaFile`], fed through a bounded queue.
#[derive(Debug)]
pub struct DeltaFileWriter {
    sender: Mutex<Option<SyncSender<BlockLocation>>>,
    delta_file: Arc<Mutex<DeltaFile>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeltaFileWriter {
    pub fn spawn(delta_file: DeltaFile, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel::<BlockLocation>(queue_depth.max(1));
        let delta_file = Arc::new(Mutex::new(delta_file));
        let sink = Arc::clone(&delta_file);
        let handle = thread::spawn(move || {
            for location in rx {
                sink.lock().locations.push(location);
            }
        });
        Self {
            sender: Mutex::new(Some(tx)),
            delta_file,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue one location; blocks while the queue is full.
    pub fn send(&self, location: BlockLocation) -> Result<()> {
        let tx = self.sender.lock().clone();
        match tx {
            Some(tx) => tx.send(location).map_err(|_| closed_writer()),
            None => Err(closed_writer()),
        }
    }

    pub fn send_all<I>(&self, locations: I) -> Result<()>
    where
        I: IntoIterator<Item = BlockLocation>,
    {
        let tx = self.sender.lock().clone().ok_or_else(closed_writer)?;
        for location in locations {
            tx.send(location).map_err(|_| closed_writer())?;
        }
        Ok(())
    }

    /// Stop accepting locations. The worker drains what is queued and exits.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Wait for the worker to drain its queue. Call after [`close`](Self::close).
    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("delta file writer thread panicked");
            }
        }
    }

    pub fn set_parser_state(&self, state: ParserState) {
        self.delta_file.lock().parser_state = state;
    }

    pub fn delta_file(&self) -> MutexGuard<'_, DeltaFile> {
        self.delta_file.lock()
    }
}

fn closed_writer() -> anyhow::Error {
    Error::InvalidDeltaFile {
        reason: "delta file writer is closed".into(),
    }
    .into()
}

pub struct DeltaFileManager {
    data_folder: FsFolder,
    decoder: Arc<dyn WalDecoder>,
    part_files: LazyCache<String, Mutex<WalPartFile>>,
    delta_writers: LazyCache<String, DeltaFileWriter>,
    cancel_tx: Mutex<Option<Sender<String>>>,
    collector: Mutex<Option<JoinHandle<()>>>,
    canceled: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for DeltaFileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaFileManager")
            .field("data_folder", &self.data_folder)
            .field("part_files", &self.part_files.len())
            .field("delta_writers", &self.delta_writers.len())
            .finish()
    }
}

impl DeltaFileManager {
    pub fn new(data_folder: FsFolder, decoder: Arc<dyn WalDecoder>, queue_depth: usize) -> Self {
        let part_folder = data_folder.clone();
        let part_files = LazyCache::new(move |part_filename: &String| {
            load_part_file(&part_folder, part_filename).map(Mutex::new)
        });

        let delta_folder = data_folder.clone();
        let delta_writers = LazyCache::new(move |delta_filename: &String| {
            let delta_file = load_delta_file(&delta_folder, delta_filename)?;
            Ok(DeltaFileWriter::spawn(delta_file, queue_depth))
        });

        let (cancel_tx, cancel_rx) = mpsc::channel::<String>();
        let canceled = Arc::new(Mutex::new(HashSet::new()));
        let collector = spawn_cancel_collector(cancel_rx, Arc::clone(&canceled));

        Self {
            data_folder,
            decoder,
            part_files,
            delta_writers,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            collector: Mutex::new(Some(collector)),
            canceled,
        }
    }

    pub fn decoder(&self) -> &Arc<dyn WalDecoder> {
        &self.decoder
    }

    pub fn data_folder(&self) -> &FsFolder {
        &self.data_folder
    }

    /// Writer of the delta file named `delta_filename`, started on first use.
    pub fn delta_file_writer(&self, delta_filename: &str) -> Result<Arc<DeltaFileWriter>> {
        Ok(self.delta_writers.load(&delta_filename.to_string())?.0)
    }

    /// Part file of the group recorded by `delta_filename`.
    pub fn part_file(&self, delta_filename: &str) -> Result<Arc<Mutex<WalPartFile>>> {
        Ok(self.part_files.load(&to_part_filename(delta_filename))?.0)
    }

    /// Stop recording the groups affected by `wal_filename`: its own group
    /// and the group of the following segment.
    pub fn cancel_recording(&self, wal_filename: &str) {
        match self.cancel_tx.lock().as_ref() {
            Some(tx) => {
                if tx.send(wal_filename.to_string()).is_err() {
                    warn!(wal_filename = %wal_filename, "cancel collector is gone");
                }
            }
            None => warn!(wal_filename = %wal_filename, "cancel requested after flush"),
        }
    }

    /// Delta groups canceled so far. Complete only after a flush.
    pub fn canceled_delta_files(&self) -> HashSet<String> {
        self.canceled.lock().clone()
    }

    fn is_canceled(&self, delta_filename: &str) -> bool {
        self.canceled.lock().contains(delta_filename)
    }

    fn mark_canceled(&self, delta_filename: &str) {
        self.canceled.lock().insert(delta_filename.to_string());
    }

    fn finish_cancel_collection(&self) {
        self.cancel_tx.lock().take();
        if let Some(handle) = self.collector.lock().take() {
            if handle.join().is_err() {
                warn!("cancel collector thread panicked");
            }
        }
    }

    /// Recording of a group may begin mid-way, at the segment a base backup
    /// started from. Archiving that backup's history file marks the slots
    /// before it as empty so the group can complete. Returns whether the
    /// part file was changed; other file names are ignored.
    pub fn handle_backup_history_file(&self, filename: &str) -> Result<bool> {
        if !filename.ends_with(BACKUP_HISTORY_SUFFIX) {
            return Ok(false);
        }
        let wal_filename = wal_filename_from_backup_history(filename)?;
        let delta_filename = delta_filename_for(&wal_filename)?;
        let part = self.part_file(&delta_filename)?;
        let mut part = part.lock();
        match part.partially_filled_start()? {
            Some(index) => {
                part.complete_partially_filled(index);
                debug!(delta_filename = %delta_filename, first_slot = index, "completed partially filled part file");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Feed the records completed by `part_file` into the group's writer and
    /// carry the last segment's unfinished record over as parser state.
    pub fn combine_part_file(&self, delta_filename: &str, part_file: &WalPartFile) -> Result<()> {
        let writer = self.delta_file_writer(delta_filename)?;
        let last_head = part_file.heads.last().cloned().flatten().unwrap_or_default();
        writer.set_parser_state(ParserState::new(last_head));
        let locations = part_file.combine_records(self.decoder.as_ref())?;
        writer.send_all(locations)
    }

    /// Combine complete part files, persist incomplete ones. Returns the
    /// delta file names whose part files were complete.
    pub fn flush_part_files(&self, snapshot: &mut DeltaFlushSnapshot) -> HashSet<String> {
        self.finish_cancel_collection();

        let mut completed = HashSet::new();
        for (part_filename, part_file) in self.part_files.entries() {
            let delta_filename = part_filename_to_delta(&part_filename);
            if self.is_canceled(&delta_filename) {
                continue;
            }
            let part_file = part_file.lock();
            if part_file.is_complete() {
                completed.insert(delta_filename.clone());
                snapshot.part_files_completed += 1;
                if let Err(err) = self.combine_part_file(&delta_filename, &part_file) {
                    self.mark_canceled(&delta_filename);
                    snapshot.failures += 1;
                    warn!(delta_filename = %delta_filename, error = %format!("{err:#}"), "canceled delta file writing");
                }
            } else {
                let saved = part_file
                    .to_bytes()
                    .and_then(|bytes| self.data_folder.write_all(&part_filename, &bytes));
                match saved {
                    Ok(()) => snapshot.part_files_saved += 1,
                    Err(err) => {
                        self.mark_canceled(&delta_filename);
                        snapshot.failures += 1;
                        warn!(part_filename = %part_filename, error = %format!("{err:#}"), "failed to save part file");
                    }
                }
            }
        }
        completed
    }

    /// Drain every writer, upload groups whose part files completed and
    /// persist the rest locally.
    pub fn flush_delta_files(
        &self,
        uploader: &Uploader,
        completed: &HashSet<String>,
        snapshot: &mut DeltaFlushSnapshot,
    ) {
        let writers = self.delta_writers.entries();
        for (_, writer) in &writers {
            writer.close();
        }
        for (_, writer) in &writers {
            writer.join();
        }

        for (delta_filename, writer) in &writers {
            if self.is_canceled(delta_filename) {
                continue;
            }
            let bytes = match writer.delta_file().to_bytes() {
                Ok(bytes) => bytes,
                Err(err) => {
                    snapshot.failures += 1;
                    warn!(delta_filename = %delta_filename, error = %format!("{err:#}"), "failed to serialize delta file");
                    continue;
                }
            };
            if completed.contains(delta_filename) {
                match uploader.upload(delta_filename, &bytes) {
                    Ok(object) => {
                        snapshot.delta_files_uploaded += 1;
                        debug!(object = %object, "uploaded delta file");
                    }
                    Err(err) => {
                        snapshot.failures += 1;
                        warn!(delta_filename = %delta_filename, error = %format!("{err:#}"), "failed to upload delta file");
                    }
                }
            } else {
                match self.data_folder.write_all(delta_filename, &bytes) {
                    Ok(()) => snapshot.delta_files_saved += 1,
                    Err(err) => {
                        snapshot.failures += 1;
                        warn!(delta_filename = %delta_filename, error = %format!("{err:#}"), "failed to save delta file");
                    }
                }
            }
        }
    }

    /// A group can complete in a later run than the one that wrote its
    /// delta file. Such writers are read from the data folder before it is
    /// cleaned.
    fn load_writers_of_complete_groups(&self, snapshot: &mut DeltaFlushSnapshot) {
        for (part_filename, part_file) in self.part_files.entries() {
            let delta_filename = part_filename_to_delta(&part_filename);
            if self.is_canceled(&delta_filename) || !part_file.lock().is_complete() {
                continue;
            }
            if let Err(err) = self.delta_file_writer(&delta_filename) {
                self.mark_canceled(&delta_filename);
                snapshot.failures += 1;
                warn!(delta_filename = %delta_filename, error = %format!("{err:#}"), "failed to load delta file");
            }
        }
    }

    /// Flush all recording state: clean the data folder, then rewrite it
    /// with whatever is still incomplete and upload completed groups.
    pub fn flush_files(&self, uploader: &Uploader) -> DeltaFlushSnapshot {
        let mut snapshot = DeltaFlushSnapshot::default();
        self.finish_cancel_collection();
        self.load_writers_of_complete_groups(&mut snapshot);
        if let Err(err) = self.data_folder.clean() {
            warn!(error = %format!("{err:#}"), "failed to clean delta folder");
        }
        let completed = self.flush_part_files(&mut snapshot);
        self.flush_delta_files(uploader, &completed, &mut snapshot);
        snapshot.canceled = self.canceled.lock().len();
        log_delta_flush(snapshot);
        snapshot
    }
}

fn spawn_cancel_collector(
    rx: Receiver<String>,
    canceled: Arc<Mutex<HashSet<String>>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for wal_filename in rx {
            let Ok(delta_filename) = delta_filename_for(&wal_filename) else {
                warn!(wal_filename = %wal_filename, "ignoring cancel for unparsable wal name");
                continue;
            };
            let mut set = canceled.lock();
            set.insert(delta_filename);
            if let Ok(next) = next_wal_filename(&wal_filename).and_then(|n| delta_filename_for(&n)) {
                set.insert(next);
            }
        }
    })
}

fn load_part_file(folder: &FsFolder, part_filename: &str) -> Result<WalPartFile> {
    match folder.read(part_filename) {
        Ok(mut reader) => WalPartFile::load(&mut reader),
        Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::ObjectNotFound(_))) => {
            Ok(WalPartFile::new())
        }
        Err(err) => Err(err),
    }
}

fn load_delta_file(folder: &FsFolder, delta_filename: &str) -> Result<DeltaFile> {
    match folder.read(delta_filename) {
        Ok(mut reader) => DeltaFile::load(&mut reader),
        Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::ObjectNotFound(_))) => {
            Ok(DeltaFile::default())
        }
        Err(err) => Err(err),
    }
}
