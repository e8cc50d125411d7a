//! Packing a data directory into archive parts.
//!
//! A [`Bundle`] walks the directory and hands each entry to a
//! [`TarBallComposer`], which decides the part it lands in. Parts come from
//! a [`TarBallQueue`] that rotates them once they outgrow the size threshold
//! and uploads closed parts in the background.

pub mod bundle;
pub mod composer;
pub mod files;
pub mod packer;
pub mod queue;
pub mod rating;
pub mod tar_ball;

use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::Context;
use tracing::info;

use crate::{
    config::PackingConfig,
    delta::DeltaMap,
    limit::DiskLimiter,
    logging::{log_packing_metrics, PackingSnapshot},
    storage::Uploader,
    Result,
};

pub use bundle::{Bundle, IncrementBase, EXCLUDED_FILENAMES, PG_CONTROL};
pub use composer::{FileWorkerPool, RegularTarBallComposer, TarBallComposer};
pub use files::{
    BackupFileDescription, BundleFiles, ComposeRatingEvaluator, CorruptBlocksInfo,
    DefaultComposeRatingEvaluator, RelFileStatistics, RelationStat, TarFileSets,
    MAX_CORRUPT_BLOCKS_TO_STORE,
};
pub use packer::{ComposeFileInfo, PackerOptions, PackingStats, TarBallFilePacker};
pub use queue::TarBallQueue;
pub use rating::{compose_files, RatedComposeFileInfo, RatingTarBallComposer, TarFilesCollection};
pub use tar_ball::{StorageTarBall, StorageTarBallMaker, TarBall, TarBallMaker, TarUpload};

/// Inputs of one packing run besides configuration.
#[derive(Debug, Default)]
pub struct PackRequest {
    /// Previous backup; `None` packs every file in full.
    pub base: Option<IncrementBase>,
    /// Changed blocks since `base`. Without it incremented files are scanned
    /// page by page.
    pub delta_map: Option<DeltaMap>,
    /// Tuple change counters; derived from `delta_map` when absent.
    pub statistics: Option<RelFileStatistics>,
    pub force_incremental: bool,
    /// Prepended to every part name.
    pub prefix: String,
}

#[derive(Debug, Clone, Default)]
pub struct PackResult {
    pub files: BTreeMap<String, BackupFileDescription>,
    pub tar_file_sets: BTreeMap<String, Vec<String>>,
    pub uploaded: Vec<String>,
    pub data_catalog_size: u64,
    pub snapshot: PackingSnapshot,
}

/// Pack `directory` and upload its parts through `uploader`.
pub fn pack_data_directory(
    config: &PackingConfig,
    uploader: &Uploader,
    directory: &Path,
    request: PackRequest,
) -> Result<PackResult> {
    config.validate()?;
    let PackRequest {
        base,
        delta_map,
        statistics,
        force_incremental,
        prefix,
    } = request;

    let maker = Arc::new(StorageTarBallMaker::new(uploader.clone(), prefix.clone()));
    let queue = Arc::new(TarBallQueue::new(
        maker,
        config.tar_size_threshold,
        config.disk_concurrency,
        config.upload_queue,
    ));
    queue.start()?;

    let statistics = Arc::new(match (statistics, &delta_map) {
        (Some(stats), _) => stats,
        (None, Some(map)) => RelFileStatistics::from_delta_map(map),
        (None, None) => RelFileStatistics::new(),
    });
    let files = Arc::new(BundleFiles::with_statistics(Arc::clone(&statistics)));
    let stats = Arc::new(PackingStats::default());
    let options = PackerOptions {
        verify_page_checksums: config.verify_page_checksums,
        store_all_corrupt_blocks: config.store_all_corrupt_blocks,
    };
    let increment_from_lsn = base.as_ref().map(|b| b.lsn);
    let base_files = base.as_ref().map(|b| b.files.clone()).unwrap_or_default();

    let composer: Box<dyn TarBallComposer> = if config.use_rating_composer {
        let packer = TarBallFilePacker::new(
            None,
            increment_from_lsn,
            Arc::clone(&files),
            options,
            DiskLimiter::from_config(config.disk_rate_limit),
            Arc::clone(&stats),
        );
        Box::new(RatingTarBallComposer::new(
            Arc::clone(&queue),
            packer,
            Arc::new(DefaultComposeRatingEvaluator::new(base_files)),
            statistics,
            delta_map,
            increment_from_lsn,
        ))
    } else {
        let packer = TarBallFilePacker::new(
            delta_map.map(Arc::new),
            increment_from_lsn,
            Arc::clone(&files),
            options,
            DiskLimiter::from_config(config.disk_rate_limit),
            Arc::clone(&stats),
        );
        Box::new(RegularTarBallComposer::new(Arc::clone(&queue), packer))
    };

    info!(
        directory = %directory.display(),
        incremental = increment_from_lsn.is_some(),
        rating = config.use_rating_composer,
        "packing data directory"
    );

    let mut bundle = Bundle::new(directory, base).with_force_incremental(force_incremental);
    let walked = bundle.walk(composer.as_ref());
    // Workers are joined and uploads awaited even when the walk failed.
    let composed = composer.finish_composing();
    let finished = queue.finish_queue();
    walked.context("walking data directory")?;
    let tar_file_sets = composed.context("composing tar parts")?;

    let mut uploaded = finished.context("finishing tar parts")?;
    if let Some((part, name)) = bundle.pack_control_file(uploader, &prefix)? {
        if let Some(control) = bundle.control_file() {
            let mtime = control.metadata()?.modified()?;
            files.add_file(&name, mtime, false);
        }
        tar_file_sets.add_file(&part, &name);
        uploaded.push(part);
    }

    let snapshot = stats.snapshot(uploaded.len() as u64);
    log_packing_metrics(snapshot);

    Ok(PackResult {
        files: files.to_map(),
        tar_file_sets: tar_file_sets.to_map(),
        uploaded,
        data_catalog_size: bundle.data_catalog_size(),
        snapshot,
    })
}
