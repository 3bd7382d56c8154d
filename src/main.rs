use anyhow::Context;
use clap::Parser;
use godis::{Config, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("godis version {}", godis::VERSION);

    let mut server = Server::bind(&config).with_context(|| format!("failed to bind {}", config.addr()))?;
    server.run().context("event loop failed")?;

    Ok(())
}
