use aislink_common::args::{AisStreamArgs, PipelineArgs, PostgresArgs};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the ingest/store/dispatch/sync pipeline and the downstream
    /// WebSocket server.
    Server(ServerArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    #[command(flatten)]
    pub aisstream: AisStreamArgs,

    /// Port the Prometheus `/metrics`, `/healthz`, and `/readyz` endpoints
    /// listen on.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,
}
