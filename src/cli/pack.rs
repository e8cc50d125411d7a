//! Implementation of `pgdelta pack` subcommand.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    archive::{pack_data_directory, BackupFileDescription, IncrementBase, PackRequest},
    config::PackingConfig,
    delta::Lsn,
    storage::{Folder, FsFolder, Uploader},
    Error, Result,
};

/// Object the manifest is stored under, next to the parts.
pub const MANIFEST_NAME: &str = "backup_manifest.json";

/// What a later incremental pack needs to know about this one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    #[serde(default)]
    pub start_lsn: Option<u64>,
    #[serde(default)]
    pub increment_from_lsn: Option<u64>,
    pub files: BTreeMap<String, BackupFileDescription>,
    pub tar_file_sets: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub data_catalog_size: u64,
}

#[derive(Debug, Clone, Args, Default)]
pub struct PackArgs {
    /// PostgreSQL data directory
    #[arg(short = 'D', long = "pgdata")]
    pub pgdata: Option<PathBuf>,

    /// Directory receiving the archive parts and the manifest
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// JSON packing configuration; PGDELTA_* variables override it
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Manifest of the backup to take an increment against
    #[arg(long = "base-manifest")]
    pub base_manifest: Option<PathBuf>,

    /// Increment base LSN; defaults to the base manifest's start LSN
    #[arg(long = "base-lsn")]
    pub base_lsn: Option<String>,

    /// Start LSN of this backup, recorded in the manifest
    #[arg(long = "start-lsn")]
    pub start_lsn: Option<String>,

    /// Treat every paged file as present in the base backup
    #[arg(long = "force-incremental", default_value_t = false)]
    pub force_incremental: bool,
}

fn load_config(args: &PackArgs) -> Result<PackingConfig> {
    match &args.config {
        Some(path) => PackingConfig::load_from_json_file(path)?.with_env_overrides(),
        None => PackingConfig::from_env(),
    }
}

fn load_base(args: &PackArgs) -> Result<Option<IncrementBase>> {
    let Some(path) = &args.base_manifest else {
        if args.base_lsn.is_some() {
            return Err(Error::Cli("base-lsn requires base-manifest".into()).into());
        }
        return Ok(None);
    };
    let manifest: BackupManifest = serde_json::from_slice(&std::fs::read(path)?)?;
    let lsn = match &args.base_lsn {
        Some(raw) => Lsn::parse(raw)?.0,
        None => manifest
            .start_lsn
            .ok_or_else(|| Error::Cli("base manifest has no start LSN, pass base-lsn".into()))?,
    };
    Ok(Some(IncrementBase {
        lsn,
        files: manifest.files.into_iter().collect(),
    }))
}

pub fn execute(args: PackArgs) -> Result<()> {
    let pgdata = args
        .pgdata
        .clone()
        .ok_or_else(|| Error::Cli("pgdata is required".into()))?;
    let output = args
        .output
        .clone()
        .ok_or_else(|| Error::Cli("output is required".into()))?;
    let start_lsn = args.start_lsn.as_deref().map(Lsn::parse).transpose()?;

    let config = load_config(&args)?;
    let base = load_base(&args)?;
    let increment_from_lsn = base.as_ref().map(|b| b.lsn);

    let folder = Arc::new(FsFolder::new(&output)?);
    let uploader = Uploader::new(folder.clone(), config.compression);
    let result = pack_data_directory(
        &config,
        &uploader,
        &pgdata,
        PackRequest {
            base,
            force_incremental: args.force_incremental,
            ..PackRequest::default()
        },
    )?;

    let manifest = BackupManifest {
        start_lsn: start_lsn.map(|l| l.0),
        increment_from_lsn,
        files: result.files,
        tar_file_sets: result.tar_file_sets,
        data_catalog_size: result.data_catalog_size,
    };
    folder.write_all(MANIFEST_NAME, &serde_json::to_vec_pretty(&manifest)?)?;

    info!(
        pgdata = %pgdata.display(),
        output = %output.display(),
        parts = result.uploaded.len(),
        files = manifest.files.len(),
        "pack finished"
    );
    Ok(())
}
