//! enrichd - batch orchestrator for enrichment pipelines.

mod cli;
mod logging;
mod server;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    logging::init(cli.verbose, cli.json_logs)?;
    log::info!("Starting enrichd v{}", env!("CARGO_PKG_VERSION"));

    cli::run(cli).await
}
