//! CLI argument definitions using clap.

pub mod commands;

use clap::{Args, Parser, Subcommand};

/// Spire - pylon fleet MQTT broker and device gateway.
#[derive(Parser)]
#[command(name = "spire")]
#[command(version)]
#[command(about = "Pylon fleet MQTT broker and device gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the broker and device gateway
    Start(StartArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Log level directive (overrides LOG_LEVEL)
    #[arg(long)]
    pub log_level: Option<String>,
}
