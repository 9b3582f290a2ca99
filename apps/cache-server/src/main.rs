//! Asset cache server entry point.

mod app;
mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting asset cache server"
    );

    let config = cli::Args::parse().resolve()?;
    tracing::info!(
        dir = %config.cache_dir.display(),
        port = config.port,
        quota_mb = config.quota_mb,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("cache server shut down cleanly");
    Ok(())
}
