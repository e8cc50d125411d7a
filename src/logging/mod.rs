//! Logging initialization using `tracing` and `tracing-subscriber`.

use tracing::{info, warn};
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Totals of one packing run, emitted when the tar ball queue drains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackingSnapshot {
    pub files_packed: u64,
    pub files_incremented: u64,
    pub files_skipped: u64,
    pub invalid_page_fallbacks: u64,
    pub corrupt_blocks: u64,
    pub bytes_packed: u64,
    pub tar_balls_uploaded: u64,
}

/// Outcome of flushing delta recording state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaFlushSnapshot {
    pub part_files_completed: usize,
    pub part_files_saved: usize,
    pub delta_files_uploaded: usize,
    pub delta_files_saved: usize,
    pub canceled: usize,
    pub failures: usize,
}

/// Initialize global tracing subscriber. Safe to call multiple times; subsequent
/// calls will no-op.
pub fn init_logging(format: LogFormat) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

pub fn log_packing_metrics(snapshot: PackingSnapshot) {
    info!(
        target = "pgdelta::packing",
        files_packed = snapshot.files_packed,
        files_incremented = snapshot.files_incremented,
        files_skipped = snapshot.files_skipped,
        invalid_page_fallbacks = snapshot.invalid_page_fallbacks,
        corrupt_blocks = snapshot.corrupt_blocks,
        bytes_packed = snapshot.bytes_packed,
        tar_balls_uploaded = snapshot.tar_balls_uploaded,
        "packing_snapshot"
    );
}

/// Failures during a flush are logged at warn level so lost delta groups
/// stand out.
pub fn log_delta_flush(snapshot: DeltaFlushSnapshot) {
    if snapshot.failures > 0 {
        warn!(
            target = "pgdelta::delta",
            part_files_completed = snapshot.part_files_completed,
            part_files_saved = snapshot.part_files_saved,
            delta_files_uploaded = snapshot.delta_files_uploaded,
            delta_files_saved = snapshot.delta_files_saved,
            canceled = snapshot.canceled,
            failures = snapshot.failures,
            "delta_flush_failures"
        );
    } else {
        info!(
            target = "pgdelta::delta",
            part_files_completed = snapshot.part_files_completed,
            part_files_saved = snapshot.part_files_saved,
            delta_files_uploaded = snapshot.delta_files_uploaded,
            delta_files_saved = snapshot.delta_files_saved,
            canceled = snapshot.canceled,
            failures = snapshot.failures,
            "delta_flush_snapshot"
        );
    }
}
