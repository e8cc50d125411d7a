//! Object storage seen as a flat, byte-oriented folder.
//!
//! Backends only need `exists/read/write/list/delete`. `FsFolder` keeps
//! objects as files under a root directory and also serves as the local
//! data folder of the delta file manager; `MemoryFolder` keeps them in a
//! concurrent map.

pub mod compression;
pub mod crypto;
pub mod uploader;

use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

use dashmap::DashMap;
use tracing::debug;
use walkdir::WalkDir;

use crate::{Error, Result};

pub use compression::{CompressionMethod, Compressor, Decompressor};
pub use crypto::Crypter;
pub use uploader::{read_decompressed, Uploader};

/// Byte-oriented object store keyed by relative `/`-separated paths.
pub trait Folder: Send + Sync {
    fn exists(&self, path: &str) -> Result<bool>;

    /// Open an object. [`Error::ObjectNotFound`] when it is absent.
    fn read(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    fn write(&self, path: &str, content: &mut dyn Read) -> Result<()>;

    /// All object paths, sorted.
    fn list(&self) -> Result<Vec<String>>;

    /// Remove an object; removing a missing object is not an error.
    fn delete(&self, path: &str) -> Result<()>;

    fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read(path)?.read_to_end(&mut out)?;
        Ok(out)
    }

    fn write_all(&self, path: &str, content: &[u8]) -> Result<()> {
        let mut reader = content;
        self.write(path, &mut reader)
    }
}

/// Folder backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsFolder {
    root: PathBuf,
}

impl FsFolder {
    /// Open (creating if needed) a folder rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::ObjectNotFound(path.to_string()).into());
        }
        Ok(self.root.join(rel))
    }

    /// Remove every object, keeping the root directory.
    pub fn clean(&self) -> Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        debug!(root = %self.root.display(), "cleaned folder");
        Ok(())
    }
}

impl Folder for FsFolder {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.is_file())
    }

    fn read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        match fs::File::open(self.resolve(path)?) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::ObjectNotFound(path.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, path: &str, content: &mut dyn Read) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        // Readers never observe a partially written object.
        let mut tmp_name = target.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp-write");
        let tmp = target.with_file_name(tmp_name);
        {
            let mut file = fs::File::create(&tmp)?;
            io::copy(content, &mut file)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        out.sort();
        Ok(out)
    }

    fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve(path)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory folder, used as a mock object store.
#[derive(Debug, Default)]
pub struct MemoryFolder {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryFolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Folder for MemoryFolder {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.contains_key(path))
    }

    fn read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let data = self
            .objects
            .get(path)
            .map(|v| v.value().clone())
            .ok_or_else(|| Error::ObjectNotFound(path.to_string()))?;
        Ok(Box::new(io::Cursor::new(data)))
    }

    fn write(&self, path: &str, content: &mut dyn Read) -> Result<()> {
        let mut data = Vec::new();
        content.read_to_end(&mut data)?;
        self.objects.insert(path.to_string(), data);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut out: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        out.sort();
        Ok(out)
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.objects.remove(path);
        Ok(())
    }
}
