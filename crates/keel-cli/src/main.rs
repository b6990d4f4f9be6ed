//! Keel CI CLI entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::Commands;

#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about = "Keel CI command-line interface", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => handlers::validate(path)?,
        Commands::Run { path } => handlers::run(path).await?,
        Commands::Build {
            project,
            file,
            revision,
            timeout_secs,
            json,
        } => handlers::build(file, project, revision, timeout_secs, json).await?,
    }

    Ok(())
}
