use anyhow::Result;
use clap::Parser;

mod args;
mod dispatcher;
mod ingest;
mod metrics;
mod outbox;
mod protocol;
mod server;
mod session;
mod store;
mod supervisor;
mod sync;

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    aislink_common::init();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server(args) => supervisor::run(args).await,
    }
}
