//! Decide which archive part each walked file goes into.

use std::{
    sync::{
        mpsc::{self, Receiver, SyncSender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::SystemTime,
};

use parking_lot::Mutex;
use tar::Header;
use tracing::warn;

use crate::{Error, Result};

use super::{
    files::{BundleFiles, TarFileSets},
    packer::{ComposeFileInfo, TarBallFilePacker},
    queue::TarBallQueue,
};

pub trait TarBallComposer: Send + Sync {
    /// Queue a regular file for packing.
    fn add_file(&self, info: ComposeFileInfo) -> Result<()>;

    /// Record a member without contents (directory, symlink, excluded entry).
    fn add_header(&self, name: &str, header: Header, mtime: SystemTime) -> Result<()>;

    /// Record a file that is unchanged since the base backup.
    fn skip_file(&self, name: &str, mtime: SystemTime);

    /// Pack everything still pending and return the part contents.
    fn finish_composing(&self) -> Result<TarFileSets>;

    fn files(&self) -> Arc<BundleFiles>;
}

pub type FileHandler = Arc<dyn Fn(ComposeFileInfo) -> Result<()> + Send + Sync>;

/// Fixed set of threads draining a bounded queue of files.
///
/// After the first failure the remaining files are drained without being
/// handled, so producers never block on a dead pool.
pub struct FileWorkerPool {
    sender: Mutex<Option<SyncSender<ComposeFileInfo>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    first_error: Arc<Mutex<Option<anyhow::Error>>>,
}

impl std::fmt::Debug for FileWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWorkerPool")
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

impl FileWorkerPool {
    pub fn spawn(workers: usize, handler: FileHandler) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::sync_channel::<ComposeFileInfo>(workers);
        let receiver = Arc::new(Mutex::new(receiver));
        let first_error = Arc::new(Mutex::new(None));

        let handles = (0..workers)
            .map(|_| {
                let receiver = Arc::clone(&receiver);
                let handler = Arc::clone(&handler);
                let first_error = Arc::clone(&first_error);
                thread::spawn(move || worker_loop(&receiver, handler.as_ref(), &first_error))
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            first_error,
        }
    }

    pub fn submit(&self, info: ComposeFileInfo) -> Result<()> {
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => sender
                .send(info)
                .map_err(|_| Error::QueueNotStarted.into()),
            None => Err(Error::QueueNotStarted.into()),
        }
    }

    /// Close the queue, wait for every worker and return the first failure.
    pub fn finish(&self) -> Result<()> {
        self.sender.lock().take();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                record_first_error(
                    &self.first_error,
                    Error::TarBallClose {
                        name: "file worker".into(),
                        reason: "worker thread panicked".into(),
                    }
                    .into(),
                );
            }
        }
        match self.first_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn record_first_error(slot: &Mutex<Option<anyhow::Error>>, err: anyhow::Error) {
    let mut slot = slot.lock();
    if slot.is_none() {
        *slot = Some(err);
    }
}

fn worker_loop(
    receiver: &Mutex<Receiver<ComposeFileInfo>>,
    handler: &(dyn Fn(ComposeFileInfo) -> Result<()> + Send + Sync),
    first_error: &Mutex<Option<anyhow::Error>>,
) {
    loop {
        let next = receiver.lock().recv();
        let Ok(info) = next else {
            return;
        };
        if first_error.lock().is_some() {
            continue;
        }
        let name = info.name.clone();
        if let Err(err) = handler(info) {
            warn!(file = %name, error = %format!("{err:#}"), "failed to handle file");
            record_first_error(first_error, err);
        }
    }
}

/// Packs files as they arrive: each worker checks a part out of the
/// queue, writes one file and hands the part back for rotation.
pub struct RegularTarBallComposer {
    queue: Arc<TarBallQueue>,
    files: Arc<BundleFiles>,
    tar_file_sets: Arc<TarFileSets>,
    pool: FileWorkerPool,
}

impl std::fmt::Debug for RegularTarBallComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegularTarBallComposer")
            .field("queue", &self.queue)
            .finish()
    }
}

impl RegularTarBallComposer {
    pub fn new(queue: Arc<TarBallQueue>, packer: TarBallFilePacker) -> Self {
        let files = Arc::clone(packer.files());
        let tar_file_sets = Arc::new(TarFileSets::new());
        let handler: FileHandler = {
            let queue = Arc::clone(&queue);
            let tar_file_sets = Arc::clone(&tar_file_sets);
            Arc::new(move |mut info: ComposeFileInfo| {
                let mut part = queue.deque()?;
                let packed = packer.pack_file_into_tar(&mut info, part.as_mut());
                if matches!(packed, Ok(true)) {
                    tar_file_sets.add_file(part.name(), &info.name);
                }
                let returned = queue.check_size_and_enqueue_back(part);
                packed.and(returned)
            })
        };
        let pool = FileWorkerPool::spawn(queue.parallelism(), handler);
        Self {
            queue,
            files,
            tar_file_sets,
            pool,
        }
    }
}

impl TarBallComposer for RegularTarBallComposer {
    fn add_file(&self, info: ComposeFileInfo) -> Result<()> {
        self.pool.submit(info)
    }

    fn add_header(&self, name: &str, mut header: Header, mtime: SystemTime) -> Result<()> {
        let mut part = self.queue.deque()?;
        header.set_size(0);
        let written = part.append(name, &mut header, &mut std::io::empty());
        if written.is_ok() {
            self.tar_file_sets.add_file(part.name(), name);
            self.files.add_file(name, mtime, false);
        }
        self.queue.enqueue_back(part);
        written.map(|_| ())
    }

    fn skip_file(&self, name: &str, mtime: SystemTime) {
        self.files.add_skipped_file(name, mtime);
    }

    fn finish_composing(&self) -> Result<TarFileSets> {
        self.pool.finish()?;
        Ok(TarFileSets::from_map(self.tar_file_sets.to_map()))
    }

    fn files(&self) -> Arc<BundleFiles> {
        Arc::clone(&self.files)
    }
}
