//! Controller catalog.
//!
//! The bootstrap registers every controller it knows about, in start order,
//! before handing the catalog to the orchestrator. Each entry pairs an
//! enablement predicate with a start routine.

use crate::aggregator::MetadataAggregator;
use crate::autoscalers::ExternalMetricsClient;
use crate::config::AgentConfig;
use crate::controllers;
use crate::error::ControllerError;
use crate::informer::InformerFactory;
use crate::leader::LeaderElector;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Resolves once a started controller's caches have synced.
pub type Readiness = BoxFuture<'static, Result<(), ControllerError>>;

/// Start routine of a controller.
///
/// The synchronous part registers informer subscriptions and spawns the
/// controller's loops; the returned future is its sync barrier.
pub type StartFn = Box<dyn Fn(&ControllerContext) -> Result<Readiness, ControllerError> + Send + Sync>;

/// Enablement predicate, evaluated once at orchestration time.
pub type EnabledFn = Box<dyn Fn() -> bool + Send + Sync>;

/// Everything a start routine may use.
pub struct ControllerContext {
    /// Shared informers; dispatch starts after every controller subscribed
    pub informers: Arc<InformerFactory>,
    /// Metadata cache fed by the metadata controller
    pub aggregator: Arc<MetadataAggregator>,
    /// Leadership capability for single-writer loops
    pub leader: Arc<dyn LeaderElector>,
    /// External metrics backend, if any
    pub metrics_client: Option<Arc<dyn ExternalMetricsClient>>,
    /// Upper bound on each controller's sync barrier
    pub cache_sync_timeout: Duration,
    /// Autoscaler refresh period
    pub autoscaler_refresh_period: Duration,
    /// Process-wide shutdown signal
    pub shutdown: CancellationToken,
}

impl ControllerContext {
    /// Builds a context using the timings of `config`.
    pub fn new(
        config: &AgentConfig,
        informers: Arc<InformerFactory>,
        aggregator: Arc<MetadataAggregator>,
        leader: Arc<dyn LeaderElector>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            informers,
            aggregator,
            leader,
            metrics_client: None,
            cache_sync_timeout: config.cache_sync_timeout,
            autoscaler_refresh_period: config.autoscaler_refresh_period,
            shutdown,
        }
    }

    /// Attaches an external metrics backend.
    pub fn with_metrics_client(mut self, client: Arc<dyn ExternalMetricsClient>) -> Self {
        self.metrics_client = Some(client);
        self
    }
}

/// A registered controller.
pub struct ControllerEntry {
    name: String,
    enabled: EnabledFn,
    start: StartFn,
}

impl ControllerEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        (self.enabled)()
    }

    pub fn start(&self, ctx: &ControllerContext) -> Result<Readiness, ControllerError> {
        (self.start)(ctx)
    }
}

/// Ordered set of controllers, keyed by unique name.
#[derive(Default)]
pub struct ControllerCatalog {
    entries: Vec<ControllerEntry>,
}

impl ControllerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a controller after the ones already present.
    ///
    /// Fails with [`ControllerError::DuplicateController`] when `name` is
    /// taken.
    pub fn register<E, S>(&mut self, name: impl Into<String>, enabled: E, start: S) -> Result<(), ControllerError>
    where
        E: Fn() -> bool + Send + Sync + 'static,
        S: Fn(&ControllerContext) -> Result<Readiness, ControllerError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.entries.iter().any(|entry| entry.name == name) {
            return Err(ControllerError::DuplicateController(name));
        }
        self.entries.push(ControllerEntry {
            name,
            enabled: Box::new(enabled),
            start: Box::new(start),
        });
        Ok(())
    }

    /// Entries in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &ControllerEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The catalog of built-in controllers, enabled according to `config`.
pub fn default_catalog(config: &AgentConfig) -> Result<ControllerCatalog, ControllerError> {
    let mut catalog = ControllerCatalog::new();

    let metadata = config.collect_metadata_tags;
    catalog.register("metadata", move || metadata, controllers::metadata::start)?;

    let external_metrics = config.external_metrics_enabled;
    catalog.register("autoscalers", move || external_metrics, controllers::autoscalers::start)?;

    let cluster_checks = config.cluster_checks_enabled;
    catalog.register("services", move || cluster_checks, controllers::cluster_checks::start_services)?;
    catalog.register("endpoints", move || cluster_checks, controllers::cluster_checks::start_endpoints)?;

    Ok(catalog)
}
