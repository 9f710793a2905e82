//! Controller orchestration.
//!
//! `run` walks the catalog in registration order, starts every enabled
//! controller and only then starts the informer factory, so every
//! subscription registered by a start routine sees the initial listing.

use crate::catalog::{ControllerCatalog, ControllerContext};
use crate::error::ControllerError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Outcome of starting the catalog.
#[derive(Debug, Default)]
pub struct Startup {
    /// Controllers whose predicate returned false
    pub skipped: Vec<String>,
    /// Controllers whose start routine succeeded
    pub started: Vec<String>,
    /// Controllers whose start routine failed
    pub failed: Vec<(String, ControllerError)>,
    readiness: Vec<(String, JoinHandle<Result<(), ControllerError>>)>,
    informers: Vec<JoinHandle<()>>,
}

impl Startup {
    /// Waits for every started controller's caches, logging each outcome.
    ///
    /// One controller timing out does not affect the others.
    pub async fn wait_ready(&mut self) -> Vec<(String, Result<(), ControllerError>)> {
        let mut outcomes = Vec::with_capacity(self.readiness.len());
        for (name, handle) in self.readiness.drain(..) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(ControllerError::Watch(format!("sync task of {} failed: {}", name, e))),
            };
            match &result {
                Ok(()) => info!("Controller {} synced", name),
                Err(e) => error!("Controller {} failed to sync: {}", name, e),
            }
            outcomes.push((name, result));
        }
        outcomes
    }

    /// Waits for the informer loops to stop once shutdown was signalled.
    pub async fn join_informers(self) {
        for handle in self.informers {
            if let Err(e) = handle.await {
                warn!("Informer task failed: {}", e);
            }
        }
    }
}

/// Starts every enabled controller of `catalog`, then begins dispatch.
///
/// Returns as soon as dispatch has begun; cache sync is awaited through
/// [`Startup::wait_ready`].
pub fn run(catalog: &ControllerCatalog, ctx: &ControllerContext) -> Startup {
    let mut startup = Startup::default();
    let mut pending = Vec::new();

    for entry in catalog.entries() {
        let name = entry.name().to_string();
        if !entry.is_enabled() {
            info!("{} is disabled", name);
            startup.skipped.push(name);
            continue;
        }

        match entry.start(ctx) {
            Ok(readiness) => {
                info!("Started {}", name);
                startup.started.push(name.clone());
                pending.push((name, readiness));
            }
            Err(e) => {
                error!("Error starting {}: {}", name, e);
                startup.failed.push((name, e));
            }
        }
    }

    startup.informers = ctx.informers.start(&ctx.shutdown);
    info!(
        "Started {} informers for {} controllers",
        startup.informers.len(),
        startup.started.len()
    );

    startup.readiness = pending
        .into_iter()
        .map(|(name, readiness)| (name, tokio::spawn(readiness)))
        .collect();
    startup
}
