//! Visitstream - visit event pipeline
//!
//! Main entry point for the visitstream binary.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use visitstream::cli::{Cli, Commands};
use visitstream::commands;
use visitstream::commands::visits::VisitsQuery;
use visitstream::config::Config;
use visitstream::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Config warnings are emitted before the configured subscriber exists
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    let config_path = cli.config.as_deref().unwrap_or("config/visitstream.yaml");
    let config = tracing::subscriber::with_default(bootstrap, || Config::load(config_path, &cli))?;

    init_logging(&config.logging)?;
    config.validate()?;

    match cli.command {
        Commands::Serve { in_memory, .. } => commands::serve::run_serve(config, in_memory).await,
        Commands::Publish { origin } => commands::publish::run_publish(config, &origin).await,
        Commands::Visits {
            key, gt, lt, day, ..
        } => {
            let query = VisitsQuery { key, gt, lt, day };
            commands::visits::run_visits(config, query).await
        }
    }
}
