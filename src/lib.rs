use once_cell::sync::Lazy;
use parking_lot::ReentrantMutex;
use thiserror::Error;

pub mod archive;
pub mod cli;
pub mod config;
pub mod delta;
pub mod limit;
pub mod logging;
pub mod page;
pub mod relfile;
pub mod storage;
pub mod wal;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid increment file header")]
    InvalidIncrementFileHeader,
    #[error("unknown increment file header version {0:#04x}")]
    UnknownIncrementFileHeader(u8),
    #[error("expected end of increment data")]
    UnexpectedTarData,
    #[error("unknown tablespace layout: {0}")]
    UnknownTablespace(String),
    #[error("invalid relation file path: {0}")]
    InvalidRelFilePath(String),
    #[error("no bitmap found for {0}")]
    NoBitmapFound(String),
    #[error("block {block_no} is invalid")]
    InvalidBlock { block_no: u32 },
    #[error("packed size {packed} does not match declared tar header size {declared}")]
    TarSize { packed: u64, declared: u64 },
    #[error("can't find delta file writer for file: {0}")]
    DeltaFileWriterNotFound(String),
    #[error("invalid delta file: {reason}")]
    InvalidDeltaFile { reason: String },
    #[error("invalid wal part file: {reason}")]
    InvalidWalPartFile { reason: String },
    #[error("invalid wal filename: {0}")]
    InvalidWalFilename(String),
    #[error("wanted to discard data from WAL while was restricted to do it")]
    CantDiscardWalData,
    #[error("wal page is filled with zeros")]
    ZeroWalPage,
    #[error("wal parse error: {0}")]
    WalParse(String),
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("upload of {path} failed: {reason}")]
    UploadFailed { path: String, reason: String },
    #[error("failed to close tar part {name}: {reason}")]
    TarBallClose { name: String, reason: String },
    #[error("tar ball queue is not started")]
    QueueNotStarted,
    #[error("tar ball queue is already started")]
    QueueAlreadyStarted,
    #[error("unsupported compression method: {0}")]
    UnsupportedCompression(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

static ENV_LOCK: Lazy<ReentrantMutex<()>> = Lazy::new(|| ReentrantMutex::new(()));

/// Process-wide lock serializing reads and writes of `PGDELTA_*` variables.
pub fn env_lock() -> &'static ReentrantMutex<()> {
    &ENV_LOCK
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    logging::init_logging(logging::LogFormat::Human)?;

    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    cli::dispatch(cli_args)
}
