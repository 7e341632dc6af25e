use anyhow::{Context, Result};
use clap::Parser;
use sql2kv_cli::server::{run, shutdown_signal};
use sql2kv_cli::{Cli, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::from_cli(&cli)?;
    init_logging(&config.log_level)?;
    run(config, shutdown_signal()).await
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level `{level}`"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))
}
