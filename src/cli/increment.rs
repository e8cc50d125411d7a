//! Implementation of `pgdelta increment` subcommand.

use std::{fs::File, io, path::PathBuf};

use clap::Args;
use tracing::info;

use crate::{delta::Lsn, limit::DiskLimiter, page::read_incremental_file, Error, Result};

#[derive(Debug, Clone, Args, Default)]
pub struct IncrementArgs {
    /// Data file to read (a relation segment such as base/16384/16385)
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// LSN of the base backup, in X/X form; pages at or below it are left out
    #[arg(long = "base-lsn")]
    pub base_lsn: Option<String>,

    /// Where to write the incremental file
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Disk read budget in bytes per second
    #[arg(long = "rate-limit")]
    pub rate_limit: Option<u64>,
}

pub fn execute(args: IncrementArgs) -> Result<()> {
    let file = args
        .file
        .ok_or_else(|| Error::Cli("file is required".into()))?;
    let output = args
        .output
        .ok_or_else(|| Error::Cli("output is required".into()))?;
    let raw_lsn = args
        .base_lsn
        .ok_or_else(|| Error::Cli("base-lsn is required".into()))?;
    let base_lsn = Lsn::parse(&raw_lsn)?;

    let size = file.metadata()?.len();
    let limiter = DiskLimiter::from_config(args.rate_limit);
    let (mut reader, encoded_len) = read_incremental_file(&file, size, base_lsn.0, None, &limiter)?;
    let blocks = reader.header().blocks.len();

    let mut out = File::create(&output)?;
    let written = io::copy(&mut reader, &mut out)?;
    out.sync_all()?;

    info!(
        file = %file.display(),
        output = %output.display(),
        base_lsn = %base_lsn,
        blocks,
        bytes = written,
        "wrote incremental file"
    );
    if written != encoded_len {
        return Err(Error::TarSize {
            packed: written,
            declared: encoded_len,
        }
        .into());
    }
    println!("{blocks} changed blocks, {written} bytes");
    Ok(())
}
