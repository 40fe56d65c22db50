pub mod commands;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fleetwatch")]
#[command(about = "Vehicle telemetry ingestion, anomaly escalation and live fan-out")]
#[command(version)]
pub struct Cli {
    /// Path to fleetwatch.toml
    #[arg(long, global = true, env = "FLEETWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP and WebSocket server
    Serve(ServeArgs),
    /// Run an NDJSON telemetry file through the pipeline and print the summary
    Replay(ReplayArgs),
}

#[derive(clap::Args)]
pub struct ServeArgs {
    /// Override the listen address from the config file
    #[arg(long, env = "FLEETWATCH_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Log as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

#[derive(clap::Args)]
pub struct ReplayArgs {
    /// NDJSON file, one telemetry payload per line
    pub file: PathBuf,

    /// Pretty-print the summary
    #[arg(long)]
    pub pretty: bool,
}
