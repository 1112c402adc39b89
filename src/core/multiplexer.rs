//! # Multiplexer: the public subscription facade.
//!
//! The [`Multiplexer`] owns one registry per topic kind (created on first use), the event
//! bus, the observer fan-out and the rotation coordinator. It is the single owner of all
//! realtime subscription state of a process; create it once and share the `Arc`.
//!
//! ## Architecture
//! ```text
//! subscribe_to_user_channel ──┐
//! subscribe_to_tenant_channel ┼─► registry::<K>() ─► Registry<K> ─► TransportAdapter ─► Transport
//! subscribe::<K>           ───┘          │
//!                                        └─ registered with RotationCoordinator
//!
//! SessionEvent ─► attach_session listener ─► RotationCoordinator
//!
//! Bus ─► observer_listener ─► SubscriberSet ─► Subscribe observers
//! ```
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use chanvisor::{MemoryTransport, Multiplexer};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(MemoryTransport::new());
//!     let mux = Multiplexer::builder(transport.clone()).build();
//!
//!     let mut sub = mux
//!         .subscribe_to_user_channel("u1", |ev| println!("video changed: {:?}", ev.row().status))
//!         .await?;
//!     assert_eq!(mux.ref_count::<chanvisor::UserChannel>("u1").await, 1);
//!
//!     sub.unsubscribe().await;
//!     mux.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::Config;
use super::entry::ChannelState;
use super::registry::{Registry, RegistryParams};
use super::rotation::RotationCoordinator;
use super::subscription::Subscription;
use crate::error::SubscribeError;
use crate::events::{Bus, Event};
use crate::session::SessionEvent;
use crate::subscribers::SubscriberSet;
use crate::topics::{ChangeEvent, Post, TenantChannel, TopicKind, UserChannel, VideoStatus};

struct Observers {
    set: Arc<SubscriberSet>,
    listener: JoinHandle<()>,
    stop: CancellationToken,
}

/// Realtime subscription multiplexer.
pub struct Multiplexer {
    cfg: Config,
    bus: Bus,
    params: RegistryParams,
    registries: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    rotation: Arc<RotationCoordinator>,
    token: CancellationToken,
    observers: Mutex<Option<Observers>>,
}

impl Multiplexer {
    pub(crate) fn new_internal(
        cfg: Config,
        bus: Bus,
        params: RegistryParams,
        rotation: Arc<RotationCoordinator>,
        token: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            bus,
            params,
            registries: Mutex::new(HashMap::new()),
            rotation,
            token,
            observers: Mutex::new(None),
        }
    }

    /// Configuration the multiplexer was built with.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Subscribes to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Subscribes to the per-user video status feed `video_status:<user_id>`.
    ///
    /// A second subscription for the same user replaces the handler of the first; both
    /// subscriptions hold a reference until released.
    pub async fn subscribe_to_user_channel<F>(
        &self,
        user_id: &str,
        on_event: F,
    ) -> Result<Subscription, SubscribeError>
    where
        F: Fn(ChangeEvent<VideoStatus>) + Send + Sync + 'static,
    {
        self.subscribe::<UserChannel, F>(user_id, on_event).await
    }

    /// Subscribes to the per-tenant post feed `posts:<tenant_id>`.
    pub async fn subscribe_to_tenant_channel<F>(
        &self,
        tenant_id: &str,
        on_event: F,
    ) -> Result<Subscription, SubscribeError>
    where
        F: Fn(ChangeEvent<Post>) + Send + Sync + 'static,
    {
        self.subscribe::<TenantChannel, F>(tenant_id, on_event).await
    }

    /// Subscribes `on_event` to the topic of kind `K` for `id`.
    ///
    /// Resolves when the join settles. Retryable transport failures do not fail the call;
    /// the stream simply starts once a retry succeeds. Non-retryable failures are returned
    /// and leave no reference behind.
    pub async fn subscribe<K, F>(&self, id: &str, on_event: F) -> Result<Subscription, SubscribeError>
    where
        K: TopicKind,
        F: Fn(K::Event) + Send + Sync + 'static,
    {
        if self.token.is_cancelled() {
            return Err(SubscribeError::ShutDown);
        }
        self.registry::<K>().subscribe(id, Arc::new(on_event)).await
    }

    /// Lifecycle state of the topic of kind `K` for `id`.
    pub async fn channel_state<K: TopicKind>(&self, id: &str) -> Option<ChannelState> {
        let topic = K::topic(id).ok()?;
        self.registry::<K>().state(&topic).await
    }

    /// Number of live subscriptions on the topic of kind `K` for `id`.
    pub async fn ref_count<K: TopicKind>(&self, id: &str) -> usize {
        match K::topic(id) {
            Ok(topic) => self.registry::<K>().ref_count(&topic).await,
            Err(_) => 0,
        }
    }

    /// Sorted topics of kind `K` currently tracked.
    pub async fn topics<K: TopicKind>(&self) -> Vec<String> {
        self.registry::<K>().topics().await
    }

    /// Tears down and rejoins every channel. Returns `false` if a rotation was already
    /// running and this refresh was folded into it.
    pub async fn on_token_refreshed(&self) -> bool {
        self.rotation.on_token_refreshed().await
    }

    /// Tears down every channel and forgets all subscription state.
    pub async fn on_signed_out(&self) {
        self.rotation.on_signed_out().await;
    }

    /// Dispatches one session event.
    pub async fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::TokenRefreshed => {
                self.on_token_refreshed().await;
            }
            SessionEvent::SignedOut => self.on_signed_out().await,
        }
    }

    /// Spawns a listener that drives rotation from a session event stream.
    ///
    /// Each token refresh runs on its own task so that refreshes arriving mid-rotation
    /// collapse into the running one. The listener stops on shutdown or when the stream
    /// closes.
    pub fn attach_session(&self, mut rx: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
        let rotation = Arc::clone(&self.rotation);
        let token = self.token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(SessionEvent::TokenRefreshed) => {
                            let rotation = Arc::clone(&rotation);
                            tokio::spawn(async move { rotation.on_token_refreshed().await });
                        }
                        Ok(SessionEvent::SignedOut) => rotation.on_signed_out().await,
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "session listener lagged");
                        }
                    }
                }
            }
        })
    }

    /// Closes every channel, fails pending and future subscribes with
    /// [`SubscribeError::ShutDown`], then drains the observers. Idempotent.
    pub async fn shutdown(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        self.rotation.shutdown().await;

        let observers = self.observers.lock().take();
        if let Some(Observers {
            set,
            listener,
            stop,
        }) = observers
        {
            stop.cancel();
            let _ = listener.await;
            if let Ok(set) = Arc::try_unwrap(set) {
                set.shutdown().await;
            }
        }
        tracing::debug!("multiplexer shut down");
    }

    /// Forwards bus events to the observer set until shutdown, then drains what is left.
    pub(crate) fn observer_listener(&self, set: SubscriberSet) {
        if set.is_empty() {
            return;
        }
        let set = Arc::new(set);
        let stop = CancellationToken::new();
        let mut rx = self.bus.subscribe();
        let (fanout, halt) = (Arc::clone(&set), stop.clone());

        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = rx.recv() => match msg {
                        Ok(ev) => fanout.emit(&ev),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "observer listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = halt.cancelled() => break,
                }
            }
            while let Ok(ev) = rx.try_recv() {
                fanout.emit(&ev);
            }
        });

        *self.observers.lock() = Some(Observers {
            set,
            listener,
            stop,
        });
    }

    /// Registry for kind `K`, created and registered for rotation on first use.
    fn registry<K: TopicKind>(&self) -> Arc<Registry<K>> {
        let mut registries = self.registries.lock();
        if let Some(existing) = registries.get(&TypeId::of::<K>()) {
            if let Ok(registry) = Arc::clone(existing).downcast::<Registry<K>>() {
                return registry;
            }
        }

        let registry = Registry::<K>::new(self.params.clone());
        registries.insert(TypeId::of::<K>(), registry.clone());
        self.rotation.register(registry.clone());
        registry
    }
}
