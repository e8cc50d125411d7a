//! Implementation of `pgdelta apply` subcommand.

use std::{fs::File, io::BufReader, path::PathBuf};

use clap::Args;
use tracing::info;

use crate::{page::apply_file_increment, Error, Result};

#[derive(Debug, Clone, Args, Default)]
pub struct ApplyArgs {
    /// Incremental file produced by `pgdelta increment`
    #[arg(short = 'i', long = "increment")]
    pub increment: Option<PathBuf>,

    /// Data file to patch; created when missing
    #[arg(short = 't', long = "target")]
    pub target: Option<PathBuf>,
}

pub fn execute(args: ApplyArgs) -> Result<()> {
    let increment = args
        .increment
        .ok_or_else(|| Error::Cli("increment is required".into()))?;
    let target = args
        .target
        .ok_or_else(|| Error::Cli("target is required".into()))?;

    let mut reader = BufReader::new(File::open(&increment)?);
    apply_file_increment(&target, &mut reader)?;
    info!(
        increment = %increment.display(),
        target = %target.display(),
        "applied incremental file"
    );
    Ok(())
}
