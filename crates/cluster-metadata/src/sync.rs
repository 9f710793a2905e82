//! Cache sync barrier.

use crate::error::ControllerError;
use crate::informer::HasSynced;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Caches a controller needs before its start counts as successful, by name.
pub type SyncSet = BTreeMap<String, Arc<dyn HasSynced>>;

/// Waits until every cache in `caches` reports synced.
///
/// Gives up after `limit` or as soon as `shutdown` fires, returning
/// [`ControllerError::SyncTimeout`] with the caches still unsynced. There is
/// no retry here.
pub async fn sync_informers(
    caches: SyncSet,
    limit: Duration,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    let pending = |caches: &SyncSet| -> Vec<String> {
        caches
            .iter()
            .filter(|(_, cache)| !cache.has_synced())
            .map(|(name, _)| name.clone())
            .collect()
    };

    if pending(&caches).is_empty() {
        return Ok(());
    }

    let wait = async {
        let mut ticker = interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let unsynced = pending(&caches);
            if unsynced.is_empty() {
                return;
            }
            debug!("Waiting for caches to sync: {}", unsynced.join(", "));
        }
    };

    let finished = tokio::select! {
        result = timeout(limit, wait) => result.is_ok(),
        _ = shutdown.cancelled() => false,
    };

    if finished {
        let names: Vec<&str> = caches.keys().map(String::as_str).collect();
        info!("Caches synced: {}", names.join(", "));
        return Ok(());
    }

    Err(ControllerError::SyncTimeout {
        caches: pending(&caches),
    })
}
