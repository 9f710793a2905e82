//! Node labels and pod service tags.

use crate::catalog::{ControllerContext, Readiness};
use crate::error::ControllerError;
use crate::informer::HasSynced;
use crate::sync::{sync_informers, SyncSet};
use std::sync::Arc;

/// Feeds Node and Endpoints events into the metadata aggregator.
///
/// The Node informer's store also becomes the aggregator's node list for
/// whole-cluster queries.
pub fn start(ctx: &ControllerContext) -> Result<Readiness, ControllerError> {
    let nodes = ctx.informers.nodes();
    let endpoints = ctx.informers.endpoints();

    ctx.aggregator.set_node_lister(Arc::new(nodes.store()));
    tokio::spawn(
        Arc::clone(&ctx.aggregator).run_node_events(nodes.subscribe(), ctx.shutdown.clone()),
    );
    tokio::spawn(
        Arc::clone(&ctx.aggregator).run_endpoints_events(endpoints.subscribe(), ctx.shutdown.clone()),
    );

    let caches = SyncSet::from([
        ("nodes".to_string(), nodes as Arc<dyn HasSynced>),
        ("endpoints".to_string(), endpoints as Arc<dyn HasSynced>),
    ]);
    Ok(Box::pin(sync_informers(caches, ctx.cache_sync_timeout, ctx.shutdown.clone())))
}
