use std::fs;

use parking_lot::ReentrantMutexGuard;
use pgdelta::{
    config::{
        PackingConfig, DEFAULT_TAR_SIZE_THRESHOLD, ENV_COMPRESSION, ENV_DELTA_QUEUE_DEPTH,
        ENV_DISK_CONCURRENCY, ENV_DISK_RATE_LIMIT, ENV_STORE_ALL_CORRUPT_BLOCKS,
        ENV_TAR_SIZE_THRESHOLD, ENV_UPLOAD_QUEUE, ENV_USE_RATING_COMPOSER,
        ENV_VERIFY_PAGE_CHECKSUMS,
    },
    storage::CompressionMethod,
    Error,
};
use tempfile::tempdir;

const ALL_KEYS: [&str; 9] = [
    ENV_DISK_CONCURRENCY,
    ENV_UPLOAD_QUEUE,
    ENV_TAR_SIZE_THRESHOLD,
    ENV_COMPRESSION,
    ENV_VERIFY_PAGE_CHECKSUMS,
    ENV_STORE_ALL_CORRUPT_BLOCKS,
    ENV_DELTA_QUEUE_DEPTH,
    ENV_USE_RATING_COMPOSER,
    ENV_DISK_RATE_LIMIT,
];

struct EnvGuard {
    key: &'static str,
    prev: Option<String>,
    _lock: ReentrantMutexGuard<'static, ()>,
}

impl EnvGuard {
    fn new(key: &'static str, value: Option<&str>) -> Self {
        let lock = pgdelta::env_lock().lock();
        let prev = std::env::var(key).ok();
        match value {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
        Self {
            key,
            prev,
            _lock: lock,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => std::env::set_var(self.key, v),
            None => std::env::remove_var(self.key),
        }
    }
}

fn clean_env() -> Vec<EnvGuard> {
    ALL_KEYS.iter().map(|key| EnvGuard::new(key, None)).collect()
}

fn expect_invalid_config(result: pgdelta::Result<PackingConfig>) {
    let err = result.expect_err("configuration should be rejected");
    assert!(
        matches!(err.downcast_ref::<Error>(), Some(Error::InvalidConfig(_))),
        "unexpected error: {err:#}"
    );
}

#[test]
fn defaults_without_environment() -> pgdelta::Result<()> {
    let _env = clean_env();
    let config = PackingConfig::from_env()?;
    assert_eq!(config, PackingConfig::default());
    assert_eq!(config.disk_concurrency, 1);
    assert_eq!(config.upload_queue, 2);
    assert_eq!(config.tar_size_threshold, DEFAULT_TAR_SIZE_THRESHOLD);
    assert_eq!(config.compression, Some(CompressionMethod::Lz4));
    assert_eq!(config.delta_queue_depth, 1024);
    assert!(!config.use_rating_composer);
    assert_eq!(config.disk_rate_limit, None);
    Ok(())
}

#[test]
fn environment_overrides_every_field() -> pgdelta::Result<()> {
    let _env = clean_env();
    let _guards = [
        EnvGuard::new(ENV_DISK_CONCURRENCY, Some("4")),
        EnvGuard::new(ENV_UPLOAD_QUEUE, Some("3")),
        EnvGuard::new(ENV_TAR_SIZE_THRESHOLD, Some("1048576")),
        EnvGuard::new(ENV_COMPRESSION, Some("zstd")),
        EnvGuard::new(ENV_VERIFY_PAGE_CHECKSUMS, Some("true")),
        EnvGuard::new(ENV_STORE_ALL_CORRUPT_BLOCKS, Some("1")),
        EnvGuard::new(ENV_DELTA_QUEUE_DEPTH, Some("16")),
        EnvGuard::new(ENV_USE_RATING_COMPOSER, Some("yes")),
        EnvGuard::new(ENV_DISK_RATE_LIMIT, Some("65536")),
    ];

    let config = PackingConfig::from_env()?;
    assert_eq!(
        config,
        PackingConfig {
            disk_concurrency: 4,
            upload_queue: 3,
            tar_size_threshold: 1 << 20,
            compression: Some(CompressionMethod::Zstd),
            verify_page_checksums: true,
            store_all_corrupt_blocks: true,
            delta_queue_depth: 16,
            use_rating_composer: true,
            disk_rate_limit: Some(65536),
        }
    );
    Ok(())
}

#[test]
fn compression_can_be_disabled() -> pgdelta::Result<()> {
    let _env = clean_env();
    let _compression = EnvGuard::new(ENV_COMPRESSION, Some("none"));
    assert_eq!(PackingConfig::from_env()?.compression, None);
    Ok(())
}

#[test]
fn zero_rate_limit_means_unlimited() -> pgdelta::Result<()> {
    let _env = clean_env();
    let _limit = EnvGuard::new(ENV_DISK_RATE_LIMIT, Some("0"));
    assert_eq!(PackingConfig::from_env()?.disk_rate_limit, None);
    Ok(())
}

#[test]
fn malformed_values_are_rejected() {
    let _env = clean_env();
    {
        let _bad = EnvGuard::new(ENV_DISK_CONCURRENCY, Some("many"));
        expect_invalid_config(PackingConfig::from_env());
    }
    {
        let _bad = EnvGuard::new(ENV_VERIFY_PAGE_CHECKSUMS, Some("maybe"));
        expect_invalid_config(PackingConfig::from_env());
    }
    {
        let _bad = EnvGuard::new(ENV_COMPRESSION, Some("brotli"));
        let err = PackingConfig::from_env().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnsupportedCompression(_))
        ));
    }
}

#[test]
fn zero_sizes_are_rejected() {
    let _env = clean_env();
    for key in [ENV_DISK_CONCURRENCY, ENV_UPLOAD_QUEUE, ENV_DELTA_QUEUE_DEPTH, ENV_TAR_SIZE_THRESHOLD] {
        let _zero = EnvGuard::new(key, Some("0"));
        expect_invalid_config(PackingConfig::from_env());
    }
}

#[test]
fn json_file_fills_missing_fields_with_defaults() -> pgdelta::Result<()> {
    let _env = clean_env();
    let dir = tempdir()?;
    let path = dir.path().join("packing.json");
    fs::write(
        &path,
        serde_json::to_vec_pretty(&serde_json::json!({
            "disk_concurrency": 2,
            "compression": "zlib",
            "use_rating_composer": true
        }))?,
    )?;

    let config = PackingConfig::load_from_json_file(&path)?;
    assert_eq!(config.disk_concurrency, 2);
    assert_eq!(config.compression, Some(CompressionMethod::Zlib));
    assert!(config.use_rating_composer);
    assert_eq!(config.upload_queue, 2);
    assert_eq!(config.tar_size_threshold, DEFAULT_TAR_SIZE_THRESHOLD);

    let _queue = EnvGuard::new(ENV_UPLOAD_QUEUE, Some("8"));
    let overridden = config.with_env_overrides()?;
    assert_eq!(overridden.upload_queue, 8);
    assert_eq!(overridden.disk_concurrency, 2);
    Ok(())
}

#[test]
fn json_file_with_zero_queue_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("packing.json");
    fs::write(&path, br#"{"upload_queue": 0}"#).unwrap();
    expect_invalid_config(PackingConfig::load_from_json_file(&path));
}
