//! Full and incremental packing of a small data directory, restored back
//! from the uploaded parts.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use pgdelta::{
    archive::{pack_data_directory, BackupFileDescription, IncrementBase, PackRequest, PackResult},
    config::PackingConfig,
    delta::DeltaMap,
    page::{apply_file_increment, PageHeader, PAGE_LAYOUT_VERSION, PAGE_SIZE},
    relfile::BlockLocation,
    storage::{read_decompressed, CompressionMethod, Compressor, Folder, MemoryFolder, Uploader},
    Error,
};
use tar::Archive;
use tempfile::{tempdir, TempDir};

const BASE_LSN: u64 = 20;
const SPC_DIR: &str = "PG_16_202307071";

fn page(lsn: u64, fill: u8) -> Vec<u8> {
    let mut page = vec![fill; PAGE_SIZE];
    let header = PageHeader {
        lsn_hi: (lsn >> 32) as u32,
        lsn_lo: lsn as u32,
        checksum: 0,
        flags: 0,
        lower: 32,
        upper: 8000,
        special: PAGE_SIZE as u16,
        page_size_version: PAGE_SIZE as u16 + PAGE_LAYOUT_VERSION,
        prune_xid: 0,
    };
    page[..24].copy_from_slice(&header.to_bytes());
    page
}

fn broken_page() -> Vec<u8> {
    let mut page = page(90, 7);
    page[12..14].copy_from_slice(&8u16.to_le_bytes());
    page
}

fn write(path: &Path, data: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

struct Cluster {
    _root: TempDir,
    pgdata: PathBuf,
    tablespace: PathBuf,
}

impl Cluster {
    fn new() -> Self {
        let root = tempdir().unwrap();
        let pgdata = root.path().join("pgdata");
        let tablespace = root.path().join("spc");

        write(&pgdata.join("PG_VERSION"), b"16\n");
        write(&pgdata.join("postgresql.conf"), b"shared_buffers = 128MB\n");
        write(&pgdata.join("postmaster.pid"), b"4242\n");
        write(&pgdata.join("global/pg_control"), &vec![3u8; PAGE_SIZE]);
        write(&pgdata.join("global/1262"), &page(10, 1));
        write(&pgdata.join("base/5/100"), &[page(10, 1), page(10, 2), page(10, 3)].concat());
        write(&pgdata.join("base/5/200"), &[page(10, 4), page(10, 5)].concat());
        write(&pgdata.join("base/5/500"), &page(10, 6));
        write(&pgdata.join("pg_wal/000000010000000000000001"), &[9u8; 100]);
        write(&pgdata.join("pg_stat_tmp/global.stat"), b"stat");
        write(
            &tablespace.join(SPC_DIR).join("5/300"),
            &[page(10, 8), page(10, 9)].concat(),
        );
        fs::create_dir_all(pgdata.join("pg_tblspc")).unwrap();
        std::os::unix::fs::symlink(&tablespace, pgdata.join("pg_tblspc/16400")).unwrap();

        Self {
            _root: root,
            pgdata,
            tablespace,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.pgdata.join(name)
    }

    /// Changes made after the full backup, all newer than [`BASE_LSN`]
    /// where pages are concerned.
    fn modify(&self) {
        // Coarse filesystem clocks must move past the full backup's mtimes.
        thread::sleep(Duration::from_millis(50));
        write(&self.path("base/5/100"), &[page(10, 1), page(50, 2), page(10, 3)].concat());
        write(&self.path("base/5/200"), &[page(10, 4), page(10, 5)].concat());
        write(&self.path("base/5/400"), &page(5, 1));
        write(&self.path("base/5/500"), &broken_page());
        write(
            &self.tablespace.join(SPC_DIR).join("5/300"),
            &[page(10, 8), page(10, 9), page(60, 10)].concat(),
        );
    }
}

fn config(use_rating_composer: bool) -> PackingConfig {
    PackingConfig {
        disk_concurrency: 2,
        tar_size_threshold: 2 * PAGE_SIZE as u64,
        compression: Some(CompressionMethod::Zstd),
        use_rating_composer,
        ..PackingConfig::default()
    }
}

fn pack(
    config: &PackingConfig,
    folder: &Arc<MemoryFolder>,
    cluster: &Cluster,
    request: PackRequest,
) -> pgdelta::Result<PackResult> {
    let uploader = Uploader::new(folder.clone(), config.compression);
    pack_data_directory(config, &uploader, &cluster.pgdata, request)
}

fn base_of(full: &PackResult) -> IncrementBase {
    IncrementBase {
        lsn: BASE_LSN,
        files: full.files.clone().into_iter().collect(),
    }
}

/// Unpack `parts` over `target`, applying increments to what is there.
fn restore(
    folder: &MemoryFolder,
    parts: &[String],
    files: &BTreeMap<String, BackupFileDescription>,
    target: &Path,
) -> pgdelta::Result<()> {
    let extension = format!(".{}", Compressor::file_extension(&CompressionMethod::Zstd));
    for part in parts {
        let name = part.strip_suffix(&extension).unwrap_or(part);
        let bytes = read_decompressed(folder, name, None)?;
        let mut archive = Archive::new(bytes.as_slice());
        for entry in archive.entries()? {
            let mut entry = entry?;
            let member = entry.path()?.to_string_lossy().into_owned();
            let path = target.join(&member);
            let kind = entry.header().entry_type();
            if kind.is_dir() {
                fs::create_dir_all(&path)?;
                continue;
            }
            if !kind.is_file() {
                continue;
            }
            fs::create_dir_all(path.parent().unwrap())?;
            if files[&member].is_incremented {
                apply_file_increment(&path, &mut entry)?;
            } else {
                io::copy(&mut entry, &mut File::create(&path)?)?;
            }
        }
    }
    Ok(())
}

fn assert_same(cluster: &Cluster, restored: &Path, names: &[&str]) {
    for name in names {
        assert_eq!(
            fs::read(restored.join(name)).unwrap(),
            fs::read(cluster.path(name)).unwrap(),
            "{name} differs after restore"
        );
    }
}

const RESTORED_FILES: &[&str] = &[
    "PG_VERSION",
    "postgresql.conf",
    "global/pg_control",
    "global/1262",
    "base/5/100",
    "base/5/200",
    "base/5/400",
    "base/5/500",
    "pg_tblspc/16400/PG_16_202307071/5/300",
];

#[test]
fn full_backup_skips_excluded_entries() -> pgdelta::Result<()> {
    let cluster = Cluster::new();
    let folder = Arc::new(MemoryFolder::new());
    let full = pack(&config(false), &folder, &cluster, PackRequest::default())?;

    for name in [
        "PG_VERSION",
        "base/5/100",
        "global/1262",
        "global/pg_control",
        "pg_wal",
        "pg_stat_tmp",
        "pg_tblspc/16400",
        "pg_tblspc/16400/PG_16_202307071/5/300",
    ] {
        assert!(full.files.contains_key(name), "{name} is missing");
    }
    for name in ["postmaster.pid", "pg_wal/000000010000000000000001", "pg_stat_tmp/global.stat"] {
        assert!(!full.files.contains_key(name), "{name} was packed");
    }
    assert!(full.files.values().all(|f| !f.is_incremented && !f.is_skipped));

    assert_eq!(full.uploaded.last().map(String::as_str), Some("pg_control.tar.zst"));
    assert_eq!(
        full.tar_file_sets.get("pg_control.tar.zst"),
        Some(&vec!["global/pg_control".to_string()])
    );
    assert!(full.uploaded.len() > 2, "parts were not rotated");
    assert!(full.data_catalog_size >= 6 * PAGE_SIZE as u64);
    assert_eq!(full.snapshot.files_incremented, 0);

    let restored = tempdir()?;
    restore(&folder, &full.uploaded, &full.files, restored.path())?;
    assert_same(&cluster, restored.path(), &RESTORED_FILES[..4]);
    assert!(!restored.path().join("postmaster.pid").exists());
    Ok(())
}

#[test]
fn incremental_backup_ships_changed_pages() -> pgdelta::Result<()> {
    let cluster = Cluster::new();
    let folder = Arc::new(MemoryFolder::new());
    let config = config(false);
    let full = pack(&config, &folder, &cluster, PackRequest::default())?;

    cluster.modify();
    let inc_folder = Arc::new(MemoryFolder::new());
    let inc = pack(
        &config,
        &inc_folder,
        &cluster,
        PackRequest {
            base: Some(base_of(&full)),
            ..PackRequest::default()
        },
    )?;

    let file = |name: &str| inc.files.get(name).cloned().unwrap();
    assert!(file("base/5/100").is_incremented);
    assert!(file("base/5/200").is_incremented);
    assert!(file("pg_tblspc/16400/PG_16_202307071/5/300").is_incremented);
    assert!(!file("base/5/400").is_incremented);
    assert!(!file("base/5/500").is_incremented);
    assert!(file("global/1262").is_skipped);
    assert!(file("PG_VERSION").is_skipped);
    assert_eq!(inc.snapshot.invalid_page_fallbacks, 1);
    assert_eq!(inc.snapshot.files_incremented, 3);

    let restored = tempdir()?;
    restore(&folder, &full.uploaded, &full.files, restored.path())?;
    restore(&inc_folder, &inc.uploaded, &inc.files, restored.path())?;
    assert_same(&cluster, restored.path(), RESTORED_FILES);
    Ok(())
}

#[test]
fn rating_composer_restores_the_same_data() -> pgdelta::Result<()> {
    let cluster = Cluster::new();
    let folder = Arc::new(MemoryFolder::new());
    let config = config(true);
    let full = pack(&config, &folder, &cluster, PackRequest::default())?;
    assert!(full.files.contains_key("base/5/100"));

    cluster.modify();
    let inc_folder = Arc::new(MemoryFolder::new());
    let inc = pack(
        &config,
        &inc_folder,
        &cluster,
        PackRequest {
            base: Some(base_of(&full)),
            ..PackRequest::default()
        },
    )?;

    let file = |name: &str| inc.files.get(name).cloned().unwrap();
    assert!(file("base/5/100").is_incremented);
    // No page newer than the base, so nothing to ship.
    assert!(file("base/5/200").is_skipped);
    assert!(!file("base/5/500").is_incremented);
    assert!(!file("base/5/500").is_skipped);

    let restored = tempdir()?;
    restore(&folder, &full.uploaded, &full.files, restored.path())?;
    restore(&inc_folder, &inc.uploaded, &inc.files, restored.path())?;
    assert_same(&cluster, restored.path(), RESTORED_FILES);
    Ok(())
}

#[test]
fn delta_map_limits_shipped_pages() -> pgdelta::Result<()> {
    let cluster = Cluster::new();
    let folder = Arc::new(MemoryFolder::new());
    let config = config(false);
    let full = pack(&config, &folder, &cluster, PackRequest::default())?;

    cluster.modify();
    let delta_map: DeltaMap = [
        BlockLocation::new(1663, 5, 100, 1),
        BlockLocation::new(16400, 5, 300, 2),
        BlockLocation::new(1663, 5, 500, 0),
    ]
    .into_iter()
    .collect();
    let inc_folder = Arc::new(MemoryFolder::new());
    let inc = pack(
        &config,
        &inc_folder,
        &cluster,
        PackRequest {
            base: Some(base_of(&full)),
            delta_map: Some(delta_map),
            ..PackRequest::default()
        },
    )?;

    assert!(inc.files["base/5/200"].is_skipped);
    assert!(inc.files["base/5/100"].is_incremented);
    assert_eq!(inc.snapshot.files_skipped, 1);

    let restored = tempdir()?;
    restore(&folder, &full.uploaded, &full.files, restored.path())?;
    restore(&inc_folder, &inc.uploaded, &inc.files, restored.path())?;
    assert_same(&cluster, restored.path(), RESTORED_FILES);
    Ok(())
}

/// Store that rejects every object after a short delay.
#[derive(Default)]
struct ReadOnlyFolder {
    in_flight: AtomicUsize,
    attempts: AtomicUsize,
}

impl Folder for ReadOnlyFolder {
    fn exists(&self, _path: &str) -> pgdelta::Result<bool> {
        Ok(false)
    }

    fn read(&self, path: &str) -> pgdelta::Result<Box<dyn Read + Send>> {
        Err(Error::ObjectNotFound(path.to_string()).into())
    }

    fn write(&self, _path: &str, content: &mut dyn Read) -> pgdelta::Result<()> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        io::copy(content, &mut io::sink())?;
        thread::sleep(Duration::from_millis(20));
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "store is read-only").into())
    }

    fn list(&self) -> pgdelta::Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn delete(&self, _path: &str) -> pgdelta::Result<()> {
        Ok(())
    }
}

#[test]
fn failed_uploads_are_awaited_before_returning() {
    let cluster = Cluster::new();
    let folder = Arc::new(ReadOnlyFolder::default());
    let config = PackingConfig {
        upload_queue: 1,
        ..config(false)
    };
    let uploader = Uploader::new(folder.clone(), config.compression);

    let err = pack_data_directory(&config, &uploader, &cluster.pgdata, PackRequest::default())
        .unwrap_err();
    assert!(format!("{err:#}").contains("store is read-only"), "{err:#}");
    assert!(folder.attempts.load(Ordering::SeqCst) > 0);
    assert_eq!(folder.in_flight.load(Ordering::SeqCst), 0);
}
