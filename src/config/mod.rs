//! Packing and recording settings.
//!
//! Settings come from a JSON file and/or `PGDELTA_*` environment variables;
//! the environment wins when both are set.

use std::{fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{env_lock, storage::CompressionMethod, Error, Result};

pub const DEFAULT_TAR_SIZE_THRESHOLD: u64 = (1 << 30) - 1;
pub const DEFAULT_DELTA_QUEUE_DEPTH: usize = 1024;

pub const ENV_DISK_CONCURRENCY: &str = "PGDELTA_DISK_CONCURRENCY";
pub const ENV_UPLOAD_QUEUE: &str = "PGDELTA_UPLOAD_QUEUE";
pub const ENV_TAR_SIZE_THRESHOLD: &str = "PGDELTA_TAR_SIZE_THRESHOLD";
pub const ENV_COMPRESSION: &str = "PGDELTA_COMPRESSION";
pub const ENV_VERIFY_PAGE_CHECKSUMS: &str = "PGDELTA_VERIFY_PAGE_CHECKSUMS";
pub const ENV_STORE_ALL_CORRUPT_BLOCKS: &str = "PGDELTA_STORE_ALL_CORRUPT_BLOCKS";
pub const ENV_DELTA_QUEUE_DEPTH: &str = "PGDELTA_DELTA_QUEUE_DEPTH";
pub const ENV_USE_RATING_COMPOSER: &str = "PGDELTA_USE_RATING_COMPOSER";
pub const ENV_DISK_RATE_LIMIT: &str = "PGDELTA_DISK_RATE_LIMIT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackingConfig {
    /// Tar parts written concurrently (pool size).
    pub disk_concurrency: usize,
    /// Rotated parts allowed to upload at once before rotation blocks.
    pub upload_queue: usize,
    /// Part size after which a part is rotated out for upload.
    pub tar_size_threshold: u64,
    pub compression: Option<CompressionMethod>,
    pub verify_page_checksums: bool,
    pub store_all_corrupt_blocks: bool,
    /// Bounded queue size of each delta file writer.
    pub delta_queue_depth: usize,
    pub use_rating_composer: bool,
    /// Disk read budget in bytes per second.
    pub disk_rate_limit: Option<u64>,
}

impl Default for PackingConfig {
    fn default() -> Self {
        Self {
            disk_concurrency: 1,
            upload_queue: 2,
            tar_size_threshold: DEFAULT_TAR_SIZE_THRESHOLD,
            compression: Some(CompressionMethod::Lz4),
            verify_page_checksums: false,
            store_all_corrupt_blocks: false,
            delta_queue_depth: DEFAULT_DELTA_QUEUE_DEPTH,
            use_rating_composer: false,
            disk_rate_limit: None,
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("{key}={raw}")).into()),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(_) => Err(Error::InvalidConfig(format!("{key} is not valid unicode")).into()),
    }
}

fn parse_bool_env(key: &str) -> Result<Option<bool>> {
    match parse_env::<String>(key)? {
        None => Ok(None),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(Error::InvalidConfig(format!("{key}={raw}")).into()),
        },
    }
}

impl PackingConfig {
    pub fn load_from_json_file(path: &Path) -> Result<Self> {
        let contents = fs::read(path)?;
        let config: PackingConfig = serde_json::from_slice(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `PGDELTA_*` variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        let _env = env_lock().lock();
        if let Some(v) = parse_env(ENV_DISK_CONCURRENCY)? {
            self.disk_concurrency = v;
        }
        if let Some(v) = parse_env(ENV_UPLOAD_QUEUE)? {
            self.upload_queue = v;
        }
        if let Some(v) = parse_env(ENV_TAR_SIZE_THRESHOLD)? {
            self.tar_size_threshold = v;
        }
        if let Some(raw) = parse_env::<String>(ENV_COMPRESSION)? {
            self.compression = match raw.to_ascii_lowercase().as_str() {
                "" | "none" => None,
                other => Some(other.parse::<CompressionMethod>()?),
            };
        }
        if let Some(v) = parse_bool_env(ENV_VERIFY_PAGE_CHECKSUMS)? {
            self.verify_page_checksums = v;
        }
        if let Some(v) = parse_bool_env(ENV_STORE_ALL_CORRUPT_BLOCKS)? {
            self.store_all_corrupt_blocks = v;
        }
        if let Some(v) = parse_env(ENV_DELTA_QUEUE_DEPTH)? {
            self.delta_queue_depth = v;
        }
        if let Some(v) = parse_bool_env(ENV_USE_RATING_COMPOSER)? {
            self.use_rating_composer = v;
        }
        if let Some(v) = parse_env::<u64>(ENV_DISK_RATE_LIMIT)? {
            self.disk_rate_limit = (v > 0).then_some(v);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.disk_concurrency == 0 {
            return Err(Error::InvalidConfig("disk_concurrency must be positive".into()).into());
        }
        if self.upload_queue == 0 {
            return Err(Error::InvalidConfig("upload_queue must be positive".into()).into());
        }
        if self.delta_queue_depth == 0 {
            return Err(Error::InvalidConfig("delta_queue_depth must be positive".into()).into());
        }
        if self.tar_size_threshold == 0 {
            return Err(Error::InvalidConfig("tar_size_threshold must be positive".into()).into());
        }
        Ok(())
    }
}
