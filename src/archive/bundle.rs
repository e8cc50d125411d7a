//! Data directory walk feeding a composer.

use std::{
    collections::HashMap,
    fs::{self, Metadata},
    io::{self, Read},
    path::{Path, PathBuf},
};

use tar::Header;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    relfile::{is_paged_file, NON_DEFAULT_TABLESPACE},
    storage::Uploader,
    Result,
};

use super::{
    composer::TarBallComposer,
    files::BackupFileDescription,
    packer::ComposeFileInfo,
    tar_ball::{StorageTarBall, TarBall},
};

/// Entries never copied into a backup. Directories with these names are
/// kept as empty directories.
pub const EXCLUDED_FILENAMES: &[&str] = &[
    "log",
    "pg_log",
    "pg_xlog",
    "pg_wal",
    "pgsql_tmp",
    "postgresql.auto.conf.tmp",
    "postmaster.pid",
    "postmaster.opts",
    "recovery.conf",
    "pg_dynshmem",
    "pg_notify",
    "pg_replslot",
    "pg_serial",
    "pg_stat_tmp",
    "pg_snapshots",
    "pg_subtrans",
];

/// Packed last, into a part of its own.
pub const PG_CONTROL: &str = "pg_control";

/// The backup an incremental backup is taken against.
#[derive(Debug, Clone, Default)]
pub struct IncrementBase {
    pub lsn: u64,
    pub files: HashMap<String, BackupFileDescription>,
}

#[derive(Debug)]
pub struct Bundle {
    directory: PathBuf,
    base: Option<IncrementBase>,
    force_incremental: bool,
    data_catalog_size: u64,
    control_file: Option<(PathBuf, Metadata)>,
}

fn is_excluded(name: &str) -> bool {
    EXCLUDED_FILENAMES.contains(&name)
}

fn tar_header(meta: &Metadata, path: &Path) -> Result<Header> {
    let mut header = Header::new_gnu();
    header.set_metadata(meta);
    if meta.file_type().is_symlink() {
        header.set_link_name(fs::read_link(path)?)?;
    }
    Ok(header)
}

impl Bundle {
    pub fn new(directory: impl Into<PathBuf>, base: Option<IncrementBase>) -> Self {
        Self {
            directory: directory.into(),
            base,
            force_incremental: false,
            data_catalog_size: 0,
            control_file: None,
        }
    }

    /// Treat every paged file as present in the base backup.
    pub fn with_force_incremental(mut self, force: bool) -> Self {
        self.force_incremental = force;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn increment_from_lsn(&self) -> Option<u64> {
        self.base.as_ref().map(|b| b.lsn)
    }

    /// Total size of every walked entry.
    pub fn data_catalog_size(&self) -> u64 {
        self.data_catalog_size
    }

    pub fn control_file(&self) -> Option<&Path> {
        self.control_file.as_ref().map(|(p, _)| p.as_path())
    }

    /// Member name of `path`: relative to the data directory, `/`-separated.
    pub fn file_rel_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.directory)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Walk the data directory, following tablespace links under
    /// `pg_tblspc`, and hand every entry to `composer`.
    pub fn walk(&mut self, composer: &dyn TarBallComposer) -> Result<()> {
        let root = self.directory.clone();
        self.walk_tree(&root, false, composer)?;
        info!(
            directory = %self.directory.display(),
            size = self.data_catalog_size,
            "walked data directory"
        );
        Ok(())
    }

    fn walk_tree(&mut self, root: &Path, follow_links: bool, composer: &dyn TarBallComposer) -> Result<()> {
        let mut entries = WalkDir::new(root)
            .min_depth(1)
            .follow_links(follow_links)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = entries.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf);
                    let io_err = io::Error::from(err);
                    if io_err.kind() == io::ErrorKind::NotFound {
                        warn!(path = ?path, "entry deleted during walk");
                        continue;
                    }
                    return Err(io_err.into());
                }
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    let io_err = io::Error::from(err);
                    if io_err.kind() == io::ErrorKind::NotFound {
                        warn!(path = %entry.path().display(), "entry deleted during walk");
                        continue;
                    }
                    return Err(io_err.into());
                }
            };
            self.data_catalog_size += meta.len();

            let path = entry.path();
            if entry.file_name() == PG_CONTROL {
                self.control_file = Some((path.to_path_buf(), meta));
                continue;
            }

            let skip_dir = self.add_to_bundle(path, &meta, composer)?;
            if skip_dir && meta.is_dir() {
                entries.skip_current_dir();
                continue;
            }

            let in_tablespace_dir = path
                .parent()
                .and_then(Path::file_name)
                .map(|n| n == NON_DEFAULT_TABLESPACE)
                .unwrap_or(false);
            if meta.file_type().is_symlink() && in_tablespace_dir {
                debug!(link = %path.display(), "walking linked tablespace");
                self.walk_tree(path, true, composer)?;
            }
        }
        Ok(())
    }

    /// Returns whether the directory at `path` must not be descended into.
    fn add_to_bundle(&self, path: &Path, meta: &Metadata, composer: &dyn TarBallComposer) -> Result<bool> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let excluded = is_excluded(&file_name);
        if excluded && !meta.is_dir() {
            return Ok(false);
        }

        let name = self.file_rel_path(path);
        let header = tar_header(meta, path)?;
        let mtime = meta.modified()?;

        if !excluded && meta.is_file() {
            let base_file = self.base.as_ref().and_then(|b| b.files.get(&name));
            let was_in_base = base_file.is_some();
            let assume_in_base = was_in_base || self.force_incremental;
            if assume_in_base && base_file.map(|f| f.mtime == mtime).unwrap_or(false) {
                debug!(file = %name, "skipped due to unchanged modification time");
                composer.skip_file(&name, mtime);
                return Ok(false);
            }
            let is_incremented =
                self.base.is_some() && assume_in_base && is_paged_file(meta, path);
            composer.add_file(ComposeFileInfo {
                path: path.to_path_buf(),
                name,
                size: meta.len(),
                mtime,
                was_in_base,
                is_incremented,
                header,
            })?;
            return Ok(false);
        }

        composer.add_header(&name, header, mtime)?;
        Ok(excluded)
    }

    /// Upload `pg_control` in its own part. Returns the part name and the
    /// member name, or `None` when the directory has no control file.
    pub fn pack_control_file(&self, uploader: &Uploader, prefix: &str) -> Result<Option<(String, String)>> {
        let Some((path, meta)) = &self.control_file else {
            return Ok(None);
        };
        let name = self.file_rel_path(path);
        let mut header = tar_header(meta, path)?;
        let mut part = Box::new(StorageTarBall::new(format!("{prefix}pg_control.tar"), uploader.clone()));
        let mut file = fs::File::open(path)?.take(meta.len());
        part.append(&name, &mut header, &mut file)?;
        let part_name = part.name().to_string();
        if let Some(upload) = part.close()? {
            upload.wait()?;
        }
        info!(part = %part_name, "uploaded control file");
        Ok(Some((part_name, name)))
    }
}
