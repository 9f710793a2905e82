//! Cluster Agent
//!
//! Runs the metadata controllers against the cluster and serves node labels
//! and pod service tags over HTTP.

mod controller;

use cluster_metadata::{AgentConfig, ControllerError};
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Cluster Agent");

    let config = AgentConfig::from_env()?;
    info!("Configuration:");
    info!("  Metadata tags: {}", config.collect_metadata_tags);
    info!("  External metrics: {}", config.external_metrics_enabled);
    info!("  Cluster checks: {}", config.cluster_checks_enabled);
    info!("  Cache sync timeout: {:?}", config.cache_sync_timeout);
    info!("  Listen address: {}", config.listen_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
