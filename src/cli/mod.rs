//! Command line surface; subcommands live here.

use clap::{error::ErrorKind, CommandFactory, Parser, Subcommand, ValueEnum};

use crate::{Error, Result};

pub mod apply;
pub mod delta_show;
pub mod increment;
pub mod inspect;
pub mod pack;

/// Output format of the inspecting subcommands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub enum Command {
    Increment(increment::IncrementArgs),
    Apply(apply::ApplyArgs),
    Inspect(inspect::InspectArgs),
    DeltaShow(delta_show::DeltaShowArgs),
    Pack(pack::PackArgs),
    None,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            command: Command::None,
        }
    }
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Increment(a) => increment::execute(a),
        Command::Apply(a) => apply::execute(a),
        Command::Inspect(a) => inspect::execute(a),
        Command::DeltaShow(a) => delta_show::execute(a),
        Command::Pack(a) => pack::execute(a),
        Command::None => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(name = "pgdelta", version, about = "Page-delta incremental backups of PostgreSQL data directories")]
struct Cli {
    #[command(subcommand)]
    command: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Build the incremental file of one data file against a base LSN.
    Increment(increment::IncrementArgs),
    /// Apply an incremental file to a data file, creating it if missing.
    Apply(apply::ApplyArgs),
    /// Print the header of an incremental file.
    Inspect(inspect::InspectArgs),
    /// Print the block locations stored in a delta file.
    DeltaShow(delta_show::DeltaShowArgs),
    /// Pack a data directory into archive parts under an output directory.
    Pack(pack::PackArgs),
}

/// Parse CLI arguments into internal representation.
///
/// `--help` and `--version` print and exit; every other parse failure is
/// returned as [`Error::Cli`].
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => err.exit(),
        Err(err) => return Err(Error::Cli(err.to_string()).into()),
    };
    let command = match cli.command {
        Some(Subcommands::Increment(args)) => Command::Increment(args),
        Some(Subcommands::Apply(args)) => Command::Apply(args),
        Some(Subcommands::Inspect(args)) => Command::Inspect(args),
        Some(Subcommands::DeltaShow(args)) => Command::DeltaShow(args),
        Some(Subcommands::Pack(args)) => Command::Pack(args),
        None => Command::None,
    };

    Ok(CliArgs { command })
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}
