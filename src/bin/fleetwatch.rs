use clap::Parser;
use fleetwatch::cli::{commands, Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Serve(args) => commands::execute_serve(config, args).await?,
        Commands::Replay(args) => commands::execute_replay(config, &args.file, args.pretty).await?,
    }

    Ok(())
}
