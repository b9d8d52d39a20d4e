//! # Kestrel Server
//!
//! Main entry point for the Kestrel job worker.

use anyhow::Context;
use kestrel_server::startup::{init_logging, print_banner, shutdown_signal};
use kestrel_server::{App, ConfigLoader};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigLoader::from_default_location()
        .load()
        .context("failed to load configuration")?;

    init_logging(&config.logging).context("failed to initialize logging")?;
    print_banner();

    info!("Starting Kestrel job worker...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let stats = App::new(config)
        .run(shutdown_signal())
        .await
        .context("worker pool stopped with an error")?;

    info!(
        processed = stats.jobs_processed,
        failed = stats.jobs_failed,
        retried = stats.jobs_retried,
        dead_lettered = stats.jobs_dead_lettered,
        cancelled = stats.jobs_cancelled,
        "Server shutdown complete"
    );

    Ok(())
}
