//! Leader-gated reconciliation.
//!
//! Some controllers produce side effects that must come from a single replica
//! of the fleet. They implement [`Reconcile`] and are driven by a
//! [`LeaderGatedController`], which only starts a tick while the injected
//! [`LeaderElector`] reports leadership. Informers and caches underneath keep
//! running on every replica.

use crate::error::ControllerError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Leadership capability provided by an external election protocol.
pub trait LeaderElector: Send + Sync {
    /// True while this replica is the leader.
    fn is_leader(&self) -> bool;

    /// Notification channel carrying the current leadership state.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Settable leadership state.
///
/// The election protocol flips it through [`LeadershipState::set_leader`];
/// a single-replica deployment constructs it already leading.
#[derive(Debug)]
pub struct LeadershipState {
    tx: watch::Sender<bool>,
}

impl LeadershipState {
    /// Creates the state with an initial leadership value.
    pub fn new(leading: bool) -> Self {
        let (tx, _rx) = watch::channel(leading);
        Self { tx }
    }

    /// Records a leadership change and notifies subscribers.
    pub fn set_leader(&self, leading: bool) {
        let changed = self.tx.send_if_modified(|current| {
            let changed = *current != leading;
            *current = leading;
            changed
        });
        if changed {
            info!("Leadership changed: leading={}", leading);
        }
    }
}

impl LeaderElector for LeadershipState {
    fn is_leader(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// One unit of single-writer work.
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Runs one tick.
    async fn reconcile(&self) -> Result<(), ControllerError>;
}

/// Runs a [`Reconcile`] periodically, but only while leading.
pub struct LeaderGatedController<R> {
    inner: R,
    leader: Arc<dyn LeaderElector>,
    period: Duration,
}

impl<R: Reconcile> LeaderGatedController<R> {
    /// Wraps `inner`, ticking every `period`.
    pub fn new(inner: R, leader: Arc<dyn LeaderElector>, period: Duration) -> Self {
        Self {
            inner,
            leader,
            period,
        }
    }

    /// Ticks until `shutdown` fires.
    ///
    /// Leadership is checked at the start of each tick only; a tick in flight
    /// when leadership is lost runs to completion. While not leading, the loop
    /// waits for leadership to come back and then ticks right away.
    pub async fn run(self, shutdown: CancellationToken) {
        let name = self.inner.name().to_string();
        let mut leadership = self.leader.subscribe();
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Starting leader-gated controller {}", name);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.leader.is_leader() {
                debug!("{}: not leader, waiting for leadership", name);
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    regained = async { leadership.wait_for(|leading| *leading).await.is_ok() } => {
                        if !regained {
                            warn!("{}: leadership notifications closed", name);
                            break;
                        }
                    }
                }
                ticker.reset_immediately();
                continue;
            }

            if let Err(e) = self.inner.reconcile().await {
                warn!("{}: reconciliation failed: {}", name, e);
            }
        }
        info!("Leader-gated controller {} stopped", name);
    }
}
