//! # Auth rotation coordinator.
//!
//! Reacts to session lifecycle:
//! - **Token refresh**: close the subscribe gate, park every entry (handlers and ref counts
//!   kept, channels closed), wait the settle delay, rejoin every parked topic, reopen the gate.
//! - **Sign-out**: tear everything down, forget parked state and join history.
//!
//! ## Rotation
//! ```text
//! on_token_refreshed()
//!   ├─► in_progress already set? → RotationCollapsed, return
//!   ├─► gate = closed              (subscribe / unsubscribe wait)
//!   ├─► registries.park()          (await all closes)
//!   ├─► sleep(settle_delay)        (cancellable by shutdown)
//!   ├─► registries.restore()       (same lineage, same handlers, fresh join)
//!   └─► gate = open, in_progress = false
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::registry::Teardown;
use crate::events::{Bus, Event, EventKind};
use crate::policies::JoinThrottle;

/// Registry operations driven by the coordinator.
#[async_trait]
pub(crate) trait Rotate: Send + Sync {
    /// Tears every entry down but remembers it for [`Rotate::restore`]. Returns the count.
    async fn park(&self) -> usize;

    /// Rejoins every parked entry. Returns the count.
    async fn restore(&self) -> usize;

    /// Tears every entry down and forgets parked state. Returns the count.
    async fn clear(&self, cause: Teardown) -> usize;
}

pub(crate) struct RotationCoordinator {
    registries: Mutex<Vec<Arc<dyn Rotate>>>,
    gate: watch::Sender<bool>,
    in_progress: AtomicBool,
    settle: Duration,
    throttle: Arc<Mutex<JoinThrottle>>,
    bus: Bus,
    token: CancellationToken,
}

impl RotationCoordinator {
    pub(crate) fn new(
        settle: Duration,
        throttle: Arc<Mutex<JoinThrottle>>,
        bus: Bus,
        token: CancellationToken,
    ) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            registries: Mutex::new(Vec::new()),
            gate,
            in_progress: AtomicBool::new(false),
            settle,
            throttle,
            bus,
            token,
        }
    }

    /// Read side of the subscribe gate.
    pub(crate) fn gate(&self) -> watch::Receiver<bool> {
        self.gate.subscribe()
    }

    pub(crate) fn register(&self, registry: Arc<dyn Rotate>) {
        self.registries.lock().push(registry);
    }

    /// True while a rotation is running.
    pub(crate) fn is_rotating(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<Arc<dyn Rotate>> {
        self.registries.lock().clone()
    }

    /// Rebuilds every channel after a token refresh.
    ///
    /// Returns `false` if a rotation was already running and this call collapsed into it.
    pub(crate) async fn on_token_refreshed(&self) -> bool {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            tracing::debug!("token refresh collapsed into running rotation");
            self.bus.publish(Event::new(EventKind::RotationCollapsed));
            return false;
        }

        self.gate.send_replace(false);
        let registries = self.snapshot();

        let parked: usize = join_all(registries.iter().map(|r| r.park()))
            .await
            .into_iter()
            .sum();
        tracing::debug!(parked, "rotation started");
        self.bus
            .publish(Event::new(EventKind::RotationStarted).with_refs(parked));

        let settled = tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = time::sleep(self.settle) => true,
        };

        let restored = if settled {
            join_all(registries.iter().map(|r| r.restore()))
                .await
                .into_iter()
                .sum()
        } else {
            0
        };

        self.gate.send_replace(true);
        self.in_progress.store(false, Ordering::SeqCst);

        tracing::debug!(restored, "rotation finished");
        self.bus
            .publish(Event::new(EventKind::RotationFinished).with_refs(restored));
        true
    }

    /// Tears down every channel and forgets all state. No resubscription.
    pub(crate) async fn on_signed_out(&self) {
        self.clear_all(Teardown::SignedOut).await;
        self.throttle.lock().clear();
        tracing::debug!("signed out; all channels torn down");
        self.bus.publish(Event::new(EventKind::SignedOut));
    }

    /// Tears down every channel for shutdown.
    pub(crate) async fn shutdown(&self) {
        self.clear_all(Teardown::ShutDown).await;
    }

    async fn clear_all(&self, cause: Teardown) -> usize {
        let registries = self.snapshot();
        join_all(registries.iter().map(|r| r.clear(cause)))
            .await
            .into_iter()
            .sum()
    }
}
