//! HPA watch list and leader-gated external metrics refresh.

use crate::autoscalers::{AutoscalerRefresh, AutoscalerWatchlist};
use crate::catalog::{ControllerContext, Readiness};
use crate::error::ControllerError;
use crate::informer::HasSynced;
use crate::leader::LeaderGatedController;
use crate::sync::{sync_informers, SyncSet};
use std::sync::Arc;

/// Tracks autoscalers using external metrics and refreshes them while
/// leading.
///
/// Fails without subscribing anything when no metrics backend is configured.
pub fn start(ctx: &ControllerContext) -> Result<Readiness, ControllerError> {
    let client = ctx.metrics_client.clone().ok_or_else(|| {
        ControllerError::InvalidConfig("external metrics are enabled but no metrics client is configured".to_string())
    })?;

    let hpas = ctx.informers.horizontal_pod_autoscalers();
    let watchlist = Arc::new(AutoscalerWatchlist::new());
    tokio::spawn(Arc::clone(&watchlist).run_events(hpas.subscribe(), ctx.shutdown.clone()));

    let refresh = LeaderGatedController::new(
        AutoscalerRefresh::new(watchlist, client),
        Arc::clone(&ctx.leader),
        ctx.autoscaler_refresh_period,
    );
    tokio::spawn(refresh.run(ctx.shutdown.clone()));

    let caches = SyncSet::from([("hpa".to_string(), hpas as Arc<dyn HasSynced>)]);
    Ok(Box::pin(sync_informers(caches, ctx.cache_sync_timeout, ctx.shutdown.clone())))
}
