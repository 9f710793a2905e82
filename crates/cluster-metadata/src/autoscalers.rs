//! External-metrics autoscaler support.
//!
//! Tracks which HorizontalPodAutoscalers reference external metrics and, from
//! the leader only, hands that list to the metrics backend on every refresh
//! tick.

use crate::aggregator::ObjectKey;
use crate::error::ControllerError;
use crate::informer::{for_each_event, WatchEvent};
use crate::leader::Reconcile;
use async_trait::async_trait;
use futures::Stream;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One external metric referenced by an autoscaler.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ExternalMetricRef {
    /// Namespace of the autoscaler
    pub namespace: String,
    /// Autoscaler name
    pub hpa: String,
    /// External metric name
    pub metric: String,
}

/// Backend computing external metric values.
#[async_trait]
pub trait ExternalMetricsClient: Send + Sync {
    /// Refreshes the values of `metrics`, sorted and deduplicated.
    async fn refresh(&self, metrics: &[ExternalMetricRef]) -> Result<(), ControllerError>;
}

/// Autoscalers that reference external metrics, kept current from HPA events.
#[derive(Debug, Default)]
pub struct AutoscalerWatchlist {
    entries: RwLock<BTreeMap<ObjectKey, Vec<ExternalMetricRef>>>,
}

impl AutoscalerWatchlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one HPA informer event.
    pub fn handle_event(&self, event: &WatchEvent<HorizontalPodAutoscaler>) {
        match event {
            WatchEvent::Added(hpa) | WatchEvent::Updated(hpa) => self.apply(hpa),
            WatchEvent::Deleted(hpa) => {
                if let Some(key) = hpa_key(hpa) {
                    self.entries.write().remove(&key);
                }
            }
        }
    }

    fn apply(&self, hpa: &HorizontalPodAutoscaler) {
        let Some(key) = hpa_key(hpa) else {
            return;
        };
        let refs = external_metrics(&key, hpa);
        let mut entries = self.entries.write();
        if refs.is_empty() {
            entries.remove(&key);
        } else {
            debug!("Autoscaler {}/{} uses {} external metrics", key.namespace, key.name, refs.len());
            entries.insert(key, refs);
        }
    }

    /// Every tracked metric reference, sorted.
    pub fn snapshot(&self) -> Vec<ExternalMetricRef> {
        let mut refs: Vec<ExternalMetricRef> = self.entries.read().values().flatten().cloned().collect();
        refs.sort();
        refs.dedup();
        refs
    }

    /// Consumes HPA events until the stream ends or `shutdown` fires.
    pub async fn run_events<S>(self: Arc<Self>, events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = WatchEvent<HorizontalPodAutoscaler>> + Unpin,
    {
        for_each_event("hpa", events, shutdown, |event| self.handle_event(&event)).await;
    }
}

fn hpa_key(hpa: &HorizontalPodAutoscaler) -> Option<ObjectKey> {
    Some(ObjectKey::new(
        hpa.metadata.namespace.as_deref()?,
        hpa.metadata.name.as_deref()?,
    ))
}

fn external_metrics(key: &ObjectKey, hpa: &HorizontalPodAutoscaler) -> Vec<ExternalMetricRef> {
    hpa.spec
        .iter()
        .flat_map(|spec| spec.metrics.iter().flatten())
        .filter_map(|metric| metric.external.as_ref())
        .map(|external| ExternalMetricRef {
            namespace: key.namespace.clone(),
            hpa: key.name.clone(),
            metric: external.metric.name.clone(),
        })
        .collect()
}

/// Leader-only tick pushing the watch list to the metrics backend.
pub struct AutoscalerRefresh {
    watchlist: Arc<AutoscalerWatchlist>,
    client: Arc<dyn ExternalMetricsClient>,
}

impl AutoscalerRefresh {
    pub fn new(watchlist: Arc<AutoscalerWatchlist>, client: Arc<dyn ExternalMetricsClient>) -> Self {
        Self { watchlist, client }
    }
}

#[async_trait]
impl Reconcile for AutoscalerRefresh {
    fn name(&self) -> &str {
        "autoscalers"
    }

    async fn reconcile(&self) -> Result<(), ControllerError> {
        let refs = self.watchlist.snapshot();
        if refs.is_empty() {
            debug!("No autoscaler references external metrics");
            return Ok(());
        }
        debug!("Refreshing {} external metrics", refs.len());
        self.client.refresh(&refs).await
    }
}
