//! Shoal CLI - run a peer that seeds or fetches one blob's torrent.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use shoal_core::logging::{CliLogLevel, LogOptions};

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "Peer connection node for P2P blob distribution")]
struct Cli {
    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the full trace log
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut log_options = LogOptions::new(cli.log_level.into());
    if let Some(logs_dir) = cli.logs_dir {
        log_options = log_options.with_logs_dir(logs_dir);
    }
    log_options.install()?;

    if let Err(error) = commands::handle_command(cli.command).await {
        if error.is_user_error() {
            tracing::warn!("Command rejected: {}", error);
        } else {
            tracing::error!("Command failed: {}", error);
        }
        anyhow::bail!(error.user_message());
    }
    Ok(())
}
