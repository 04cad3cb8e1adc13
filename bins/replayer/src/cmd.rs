//! Subcommands.

pub mod convert;
pub mod replay;

use clap::{Parser, Subcommand};

/// Replays EEST blockchain fixtures against live execution clients.
#[derive(Parser, Debug)]
#[command(name = "replayer", version, infer_subcommands = true)]
pub struct MainCmd {
    /// Log at debug level unless `RUST_LOG` is set
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum Command {
    /// Replay payloads or fixtures against a network
    Replay(replay::Cmd),
    /// Convert a fixtures directory into a payload file
    Convert(convert::Cmd),
}

/// Errors of any subcommand.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Replay failed.
    #[error(transparent)]
    Replay(#[from] replay::Error),
    /// Conversion failed.
    #[error(transparent)]
    Convert(#[from] convert::Error),
}

impl MainCmd {
    /// Runs the selected subcommand.
    pub fn run(&self) -> Result<(), Error> {
        match &self.command {
            Command::Replay(cmd) => cmd.run().map_err(Into::into),
            Command::Convert(cmd) => cmd.run().map_err(Into::into),
        }
    }
}
