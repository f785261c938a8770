mod broker;
mod cli;
mod config;
mod logging;
mod rpc;
mod state;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    let cli = cli::Cli::parse();
    cli.execute().await
}
