//! Compress, encrypt, and store objects; the reverse on download.
//!
//! Uploads are streamed through the encoders into a temporary file that is
//! then handed to the folder, so an object is never held in memory.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::Arc,
};

use tracing::debug;

use crate::{Error, Result};

use super::{
    compression::{CompressionMethod, Compressor, Decompressor},
    crypto::Crypter,
    Folder,
};

#[derive(Clone)]
pub struct Uploader {
    folder: Arc<dyn Folder>,
    compression: Option<CompressionMethod>,
    crypter: Option<Arc<dyn Crypter>>,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("compression", &self.compression)
            .field("encrypted", &self.crypter.is_some())
            .finish()
    }
}

impl Uploader {
    pub fn new(folder: Arc<dyn Folder>, compression: Option<CompressionMethod>) -> Self {
        Self {
            folder,
            compression,
            crypter: None,
        }
    }

    pub fn with_crypter(mut self, crypter: Arc<dyn Crypter>) -> Self {
        self.crypter = Some(crypter);
        self
    }

    pub fn folder(&self) -> &Arc<dyn Folder> {
        &self.folder
    }

    pub fn compression(&self) -> Option<CompressionMethod> {
        self.compression
    }

    /// Object name `name` will be stored under.
    pub fn object_name(&self, name: &str) -> String {
        match self.compression {
            Some(method) => format!("{name}.{}", Compressor::file_extension(&method)),
            None => name.to_string(),
        }
    }

    /// Store `data` as `name`. Returns the stored object name.
    pub fn upload(&self, name: &str, data: &[u8]) -> Result<String> {
        let mut reader = data;
        self.upload_reader(name, &mut reader)
    }

    /// Stream `reader` into the folder as `name`.
    pub fn upload_reader(&self, name: &str, reader: &mut dyn Read) -> Result<String> {
        let mut staged = tempfile::tempfile()?;
        let read = self.encode(reader, &mut staged)?;
        let stored = staged.stream_position()?;
        staged.seek(SeekFrom::Start(0))?;

        let object = self.object_name(name);
        self.folder
            .write(&object, &mut staged)
            .map_err(|e| Error::UploadFailed {
                path: object.clone(),
                reason: format!("{e:#}"),
            })?;
        debug!(object = %object, bytes = read, stored, "uploaded object");
        Ok(object)
    }

    /// Compress, then encrypt, `reader` into `staged`. Returns the number of
    /// source bytes read.
    fn encode(&self, reader: &mut dyn Read, staged: &mut File) -> Result<u64> {
        let sink: Box<dyn Write + Send + '_> = match &self.crypter {
            Some(crypter) => crypter.encrypt(Box::new(&mut *staged))?,
            None => Box::new(&mut *staged),
        };
        let (read, mut sink) = match self.compression {
            Some(method) => {
                let mut encoder = method.encoder(sink)?;
                let read = io::copy(reader, &mut encoder)?;
                (read, encoder.finish()?)
            }
            None => {
                let mut sink = sink;
                let read = io::copy(reader, &mut sink)?;
                (read, sink)
            }
        };
        sink.flush()?;
        // Dropping the encrypting writer finalizes it.
        drop(sink);
        Ok(read)
    }
}

/// Locate `name` under any known compression extension (or none), decrypt
/// and decompress it.
pub fn read_decompressed(
    folder: &dyn Folder,
    name: &str,
    crypter: Option<&dyn Crypter>,
) -> Result<Vec<u8>> {
    let decrypt = |raw: Box<dyn Read + Send>| -> Result<Box<dyn Read + Send>> {
        match crypter {
            Some(c) => c.decrypt(raw),
            None => Ok(raw),
        }
    };

    for method in CompressionMethod::ALL {
        let object = format!("{name}.{}", Decompressor::file_extension(&method));
        if folder.exists(&object)? {
            let mut out = Vec::new();
            method
                .decoder(decrypt(folder.read(&object)?)?)?
                .read_to_end(&mut out)?;
            return Ok(out);
        }
    }
    if folder.exists(name)? {
        let mut reader = decrypt(folder.read(name)?)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        return Ok(out);
    }
    Err(Error::ObjectNotFound(name.to_string()).into())
}
