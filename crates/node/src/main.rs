//! Clinisync node
//!
//! Runs a peripheral clinic node or the central aggregator until Ctrl-C.
//! Configuration comes from `CLINISYNC_CONFIG` when set, otherwise from
//! `CLINISYNC_*` environment variables or a probed config file.

use std::path::PathBuf;

use anyhow::Context;
use clinisync_domain::Config;
use clinisync_infra::config;
use clinisync_node::utils::logging;
use clinisync_node::NodeContext;
use tracing::{error, info, warn};

fn load_config() -> clinisync_domain::Result<Config> {
    match std::env::var_os("CLINISYNC_CONFIG") {
        Some(path) => {
            let config = config::load_from_file(Some(PathBuf::from(path)))?;
            config::validate(&config)?;
            Ok(config)
        }
        None => config::load(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Before config loading so .env values are visible to it
    let dotenv = dotenvy::dotenv();

    let config = load_config().context("failed to load node configuration")?;
    logging::init(&config.logging).context("failed to initialise logging")?;

    match dotenv {
        Ok(path) => info!(path = %path.display(), "Loaded .env"),
        Err(e) => warn!(error = %e, "Could not load .env file"),
    }

    let mut node = NodeContext::new(config).await.context("failed to build node")?;
    node.start().await.context("failed to start node")?;
    info!(role = %node.role(), "Node running; press Ctrl-C to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
    }

    info!("Shutting down");
    if let Err(err) = node.shutdown().await {
        error!(error = %err, kind = err.label(), "Shutdown was not clean");
        return Err(err.into());
    }
    Ok(())
}
