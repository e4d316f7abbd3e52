//! Command-line arguments for `manga-worker`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "manga-worker",
    version,
    about = "Run translation jobs from the durable queue.",
    long_about = None
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Consume the queue until SIGINT/SIGTERM (the default).
    Run,

    /// Copy a local file into storage and enqueue it for translation.
    Submit {
        /// Image (jpg, jpeg, png, webp) or zip archive.
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

impl CliArgs {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}
