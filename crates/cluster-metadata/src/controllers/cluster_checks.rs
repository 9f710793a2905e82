//! Informers kept warm for cluster checks.
//!
//! These controllers only need the caches populated; nothing subscribes to
//! their events here.

use crate::catalog::{ControllerContext, Readiness};
use crate::error::ControllerError;
use crate::informer::HasSynced;
use crate::sync::{sync_informers, SyncSet};
use std::sync::Arc;

/// Runs the Service informer.
pub fn start_services(ctx: &ControllerContext) -> Result<Readiness, ControllerError> {
    let services: Arc<dyn HasSynced> = ctx.informers.services();
    Ok(barrier(ctx, "services", services))
}

/// Runs the Endpoints informer.
pub fn start_endpoints(ctx: &ControllerContext) -> Result<Readiness, ControllerError> {
    let endpoints: Arc<dyn HasSynced> = ctx.informers.endpoints();
    Ok(barrier(ctx, "endpoints", endpoints))
}

fn barrier(ctx: &ControllerContext, name: &str, cache: Arc<dyn HasSynced>) -> Readiness {
    let caches = SyncSet::from([(name.to_string(), cache)]);
    Box::pin(sync_informers(caches, ctx.cache_sync_timeout, ctx.shutdown.clone()))
}
