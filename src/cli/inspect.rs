//! Implementation of `pgdelta inspect` subcommand.

use std::{fs::File, io::BufReader, path::PathBuf};

use clap::Args;
use serde::Serialize;

use crate::{page::read_increment_header, Error, Result};

use super::OutputFormat;

#[derive(Debug, Clone, Args, Default)]
pub struct InspectArgs {
    /// Incremental file to describe
    #[arg(short = 'i', long = "increment")]
    pub increment: Option<PathBuf>,

    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct IncrementSummary {
    file_size: u64,
    page_count: u64,
    changed_blocks: usize,
    blocks: Vec<u32>,
}

pub fn execute(args: InspectArgs) -> Result<()> {
    let increment = args
        .increment
        .ok_or_else(|| Error::Cli("increment is required".into()))?;
    let header = read_increment_header(&mut BufReader::new(File::open(&increment)?))?;
    let summary = IncrementSummary {
        file_size: header.file_size,
        page_count: header.page_count(),
        changed_blocks: header.blocks.len(),
        blocks: header.blocks,
    };

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => {
            println!("file size: {}", summary.file_size);
            println!("pages: {}", summary.page_count);
            println!("changed blocks: {}", summary.changed_blocks);
            for block in &summary.blocks {
                println!("  {block}");
            }
        }
    }
    Ok(())
}
