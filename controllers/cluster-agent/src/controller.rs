//! Main controller implementation.
//!
//! Wires the kube client, shared informers, metadata cache and query API
//! together and runs them until Ctrl+C.

use cluster_metadata::api::{self, ApiState};
use cluster_metadata::metrics::ApiMetrics;
use cluster_metadata::{
    default_catalog, orchestrator, AgentConfig, ControllerCatalog, ControllerContext, ControllerError,
    InformerFactory, LeadershipState, MetadataAggregator,
};
use kube::Client;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cluster agent process.
pub struct Controller {
    config: AgentConfig,
    catalog: ControllerCatalog,
    context: ControllerContext,
    aggregator: Arc<MetadataAggregator>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Creates the controller and its catalog without starting anything.
    pub async fn new(config: AgentConfig) -> Result<Self, ControllerError> {
        info!("Initializing Cluster Agent");

        let kube_client = Client::try_default().await?;
        let shutdown = CancellationToken::new();
        let aggregator = Arc::new(MetadataAggregator::new());

        // Single replica: this process always leads.
        let context = ControllerContext::new(
            &config,
            Arc::new(InformerFactory::new(kube_client)),
            Arc::clone(&aggregator),
            Arc::new(LeadershipState::new(true)),
            shutdown.clone(),
        );
        let catalog = default_catalog(&config)?;

        Ok(Self {
            config,
            catalog,
            context,
            aggregator,
            shutdown,
        })
    }

    /// Runs the controllers and the query API until Ctrl+C.
    pub async fn run(self) -> Result<(), ControllerError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let state = ApiState::new(self.aggregator, ApiMetrics::new()?);
        let server = tokio::spawn(api::serve(listener, api::router(state), self.shutdown.clone()));

        let mut startup = orchestrator::run(&self.catalog, &self.context);
        info!(
            "Controllers started: {} running, {} disabled, {} failed",
            startup.started.len(),
            startup.skipped.len(),
            startup.failed.len()
        );

        tokio::select! {
            outcomes = startup.wait_ready() => {
                let synced = outcomes.iter().filter(|(_, result)| result.is_ok()).count();
                info!("{} of {} controllers synced", synced, outcomes.len());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C during startup");
                self.shutdown.cancel();
            }
        }

        if !self.shutdown.is_cancelled() {
            info!("Cluster Agent running");
            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl+C, shutting down");
            self.shutdown.cancel();
        }

        startup.join_informers().await;
        match server.await {
            Ok(result) => result?,
            Err(e) => error!("Metadata API task panicked: {}", e),
        }

        info!("Cluster Agent stopped");
        Ok(())
    }
}
