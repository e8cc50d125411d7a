//! Implementation of `pgdelta delta-show` subcommand.

use std::{fs::File, io::BufReader, path::PathBuf};

use clap::Args;

use crate::{
    delta::DeltaFile,
    storage::{CompressionMethod, Decompressor},
    Error, Result,
};

use super::OutputFormat;

#[derive(Debug, Clone, Args, Default)]
pub struct DeltaShowArgs {
    /// Stored delta file; a compression extension (.lz4, .zst, .zz) is honoured
    #[arg(short = 'd', long = "delta")]
    pub delta: Option<PathBuf>,

    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,
}

/// Read a delta file from disk, decompressing by extension.
pub fn load_delta_file(path: &std::path::Path) -> Result<DeltaFile> {
    let method = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(CompressionMethod::from_extension);
    let mut reader = BufReader::new(File::open(path)?);
    match method {
        Some(method) => {
            let raw = method.decompress(&mut reader)?;
            DeltaFile::load(&mut raw.as_slice())
        }
        None => DeltaFile::load(&mut reader),
    }
}

pub fn execute(args: DeltaShowArgs) -> Result<()> {
    let path = args
        .delta
        .ok_or_else(|| Error::Cli("delta is required".into()))?;
    let delta = load_delta_file(&path)?;

    match args.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&delta.locations)?);
        }
        OutputFormat::Text => {
            for location in &delta.locations {
                println!("{location}");
            }
            println!(
                "{} locations, parser state {} bytes",
                delta.locations.len(),
                delta.parser_state.current_record.len()
            );
        }
    }
    Ok(())
}
