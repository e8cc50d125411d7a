//! Archive parts written to a local scratch file and uploaded on close.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    sync::atomic::{AtomicU32, Ordering},
    thread::{self, JoinHandle},
};

use tar::{Builder, Header};
use tracing::{debug, info};

use crate::{storage::Uploader, Error, Result};

/// One archive member container. Owned by exactly one writer at a time.
pub trait TarBall: Send {
    /// Object name the part is uploaded under.
    fn name(&self) -> &str;

    /// Bytes of member contents written so far.
    fn size(&self) -> u64;

    /// Whether anything was written. Unstarted parts are dropped on close.
    fn is_started(&self) -> bool;

    /// Append one member. `header` must already carry the member's size;
    /// returns the number of content bytes copied from `contents`.
    fn append(&mut self, name: &str, header: &mut Header, contents: &mut dyn Read) -> Result<u64>;

    /// Finish the archive and start its upload in the background.
    fn close(self: Box<Self>) -> Result<Option<TarUpload>>;
}

pub trait TarBallMaker: Send + Sync {
    fn make(&self) -> Box<dyn TarBall>;
}

/// Handle of a part upload running on its own thread.
#[derive(Debug)]
pub struct TarUpload {
    name: String,
    handle: JoinHandle<Result<String>>,
}

impl TarUpload {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the upload finishes and return the stored object name.
    pub fn wait(self) -> Result<String> {
        match self.handle.join() {
            Ok(result) => result.map_err(|e| {
                Error::TarBallClose {
                    name: self.name.clone(),
                    reason: format!("{e:#}"),
                }
                .into()
            }),
            Err(_) => Err(Error::TarBallClose {
                name: self.name,
                reason: "upload thread panicked".into(),
            }
            .into()),
        }
    }
}

struct CountingReader<'a> {
    inner: &'a mut dyn Read,
    count: u64,
}

impl Read for CountingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Part buffered in an anonymous temp file and handed to an [`Uploader`].
pub struct StorageTarBall {
    base_name: String,
    name: String,
    uploader: Uploader,
    builder: Option<Builder<File>>,
    size: u64,
}

impl std::fmt::Debug for StorageTarBall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageTarBall")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("started", &self.builder.is_some())
            .finish()
    }
}

impl StorageTarBall {
    /// `base_name` is the part name before the compression extension.
    pub fn new(base_name: impl Into<String>, uploader: Uploader) -> Self {
        let base_name = base_name.into();
        Self {
            name: uploader.object_name(&base_name),
            base_name,
            uploader,
            builder: None,
            size: 0,
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.builder.is_none() {
            self.builder = Some(Builder::new(tempfile::tempfile()?));
            debug!(part = %self.name, "started tar part");
        }
        Ok(())
    }
}

impl TarBall for StorageTarBall {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_started(&self) -> bool {
        self.builder.is_some()
    }

    fn append(&mut self, name: &str, header: &mut Header, contents: &mut dyn Read) -> Result<u64> {
        let mut counting = CountingReader {
            inner: contents,
            count: 0,
        };
        self.start()?;
        if let Some(builder) = self.builder.as_mut() {
            builder.append_data(header, name, &mut counting)?;
        }
        self.size += counting.count;
        Ok(counting.count)
    }

    fn close(self: Box<Self>) -> Result<Option<TarUpload>> {
        let StorageTarBall {
            base_name,
            name,
            uploader,
            builder,
            size,
        } = *self;
        let Some(builder) = builder else {
            return Ok(None);
        };
        let mut file = builder.into_inner().map_err(|e| Error::TarBallClose {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        file.seek(SeekFrom::Start(0))?;

        let handle = thread::spawn(move || {
            let stored = uploader.upload_reader(&base_name, &mut file)?;
            info!(part = %stored, bytes = size, "uploaded tar part");
            Ok(stored)
        });
        Ok(Some(TarUpload { name, handle }))
    }
}

/// Makes parts named `part_NNN.tar[.<ext>]`.
pub struct StorageTarBallMaker {
    uploader: Uploader,
    prefix: String,
    counter: AtomicU32,
}

impl StorageTarBallMaker {
    /// `prefix` is prepended to every part name (for example a backup name
    /// followed by `/`).
    pub fn new(uploader: Uploader, prefix: impl Into<String>) -> Self {
        Self {
            uploader,
            prefix: prefix.into(),
            counter: AtomicU32::new(0),
        }
    }
}

impl TarBallMaker for StorageTarBallMaker {
    fn make(&self) -> Box<dyn TarBall> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let base = format!("{}part_{n:03}.tar", self.prefix);
        Box::new(StorageTarBall::new(base, self.uploader.clone()))
    }
}
