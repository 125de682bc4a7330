//! Spire - unified CLI entrypoint.
//!
//! Usage:
//!   spire start

use anyhow::Result;
use clap::Parser;
use spire::cli::commands::run_start;
use spire::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
    }
}
