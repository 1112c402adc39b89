//! # Subscription registry: topic → channel entry.
//!
//! One [`Registry`] exists per [`TopicKind`]; all of them share the transport, the event bus,
//! the join throttle and the rotation gate. The registry owns every creation, reuse and
//! teardown decision for its topics.
//!
//! ## Architecture
//! ```text
//! subscribe(id, handler)
//!     ├─► wait rotation gate / pending teardown
//!     ├─► entry.attach(handler)          (ref count + 1, handler replaced)
//!     ├─► Joined    → resolved immediately
//!     ├─► Pending   → await shared join future
//!     └─► Idle      → begin_attempt + spawn driver
//!
//! driver (one per attempt chain)
//!     ├─► sleep(backoff)          (cancellable)
//!     ├─► wait join throttle      (cancellable)
//!     ├─► adapter.open → spawn pump(signals)
//!     └─► adapter.join
//!           ├─ Ok            → Joined, record throttle, reset backoff
//!           ├─ retryable     → Error, close, next delay, loop
//!           └─ non-retryable → Error, settle waiters with the error
//!
//! pump (one per physical channel)
//!     ├─► Message → decode → handlers (in transport order)
//!     ├─► Error   → same path as a failed join
//!     └─► Closed  → entry removed
//! ```
//!
//! ## Rules
//! - The table lock is never held across a transport call.
//! - Every attempt has a generation; results and signals of an older generation are ignored.
//! - A topic being torn down has a close marker; subscribers wait for it before rejoining.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use parking_lot::Mutex;
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::entry::{
    ChannelEntry, ChannelState, EntryState, Handler, JoinFuture, JoinOutcome, JoinResolution,
};
use super::rotation::Rotate;
use super::subscription::{Release, Subscription};
use crate::error::{SubscribeError, TransportError};
use crate::events::{Bus, Event, EventKind};
use crate::policies::{BackoffPolicy, JoinThrottle};
use crate::topics::TopicKind;
use crate::transport::{ChannelHandle, Signal, TransportAdapter};

/// Collaborators shared by every registry of one multiplexer.
#[derive(Clone)]
pub(crate) struct RegistryParams {
    pub(crate) adapter: TransportAdapter,
    pub(crate) bus: Bus,
    pub(crate) throttle: Arc<Mutex<JoinThrottle>>,
    pub(crate) backoff: BackoffPolicy,
    pub(crate) max_retries: Option<u32>,
    /// Open unless a token rotation is running.
    pub(crate) gate: watch::Receiver<bool>,
    pub(crate) token: CancellationToken,
}

/// Why an entry is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    Released,
    Remote,
    Rotation,
    SignedOut,
    ShutDown,
}

impl Teardown {
    fn as_label(self) -> &'static str {
        match self {
            Teardown::Released => "released",
            Teardown::Remote => "remote",
            Teardown::Rotation => "rotation",
            Teardown::SignedOut => "signed_out",
            Teardown::ShutDown => "shutdown",
        }
    }

    /// What subscribers still waiting on the entry's join are told.
    fn outcome(self) -> JoinOutcome {
        match self {
            Teardown::Released | Teardown::Remote | Teardown::Rotation => {
                Ok(JoinResolution::Superseded)
            }
            Teardown::SignedOut => Err(SubscribeError::SignedOut),
            Teardown::ShutDown => Err(SubscribeError::ShutDown),
        }
    }
}

type CloseWait = Shared<BoxFuture<'static, ()>>;

/// Logical state of an entry kept across a token rotation.
struct Parked<K: TopicKind> {
    topic: String,
    ident: Arc<str>,
    lineage: u64,
    generation: u64,
    refs: usize,
    handlers: HashMap<Arc<str>, Handler<K::Event>>,
}

/// An entry removed from the table whose channel still has to be closed.
struct Closing<K: TopicKind> {
    topic: String,
    entry: ChannelEntry<K>,
    done: oneshot::Sender<()>,
}

struct Table<K: TopicKind> {
    entries: HashMap<String, ChannelEntry<K>>,
    /// Close markers keyed by topic, tagged with the lineage being closed.
    closing: HashMap<String, (u64, CloseWait)>,
    parked: Vec<Parked<K>>,
}

impl<K: TopicKind> Table<K> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            closing: HashMap::new(),
            parked: Vec::new(),
        }
    }

    /// Removes `topic` and leaves a close marker in its place.
    fn take_for_close(&mut self, topic: &str) -> Option<Closing<K>> {
        let entry = self.entries.remove(topic)?;
        let (done, rx) = oneshot::channel::<()>();
        let wait = rx.map(|_| ()).boxed().shared();
        self.closing.insert(topic.to_string(), (entry.id, wait));
        Some(Closing {
            topic: topic.to_string(),
            entry,
            done,
        })
    }

    fn take_all_for_close(&mut self) -> Vec<Closing<K>> {
        let topics: Vec<String> = self.entries.keys().cloned().collect();
        topics
            .iter()
            .filter_map(|topic| self.take_for_close(topic))
            .collect()
    }
}

enum Waiter {
    Ready(JoinOutcome),
    Join(JoinFuture),
}

/// Registry of the topics of one kind.
pub(crate) struct Registry<K: TopicKind> {
    table: RwLock<Table<K>>,
    params: RegistryParams,
    me: Weak<Self>,
}

impl<K: TopicKind> Registry<K> {
    pub(crate) fn new(params: RegistryParams) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            table: RwLock::new(Table::new()),
            params,
            me: me.clone(),
        })
    }

    /// Adds a reference on the topic of `ident` and installs `handler` for it.
    ///
    /// Resolves once the join settles: joined, retrying in the background, or carried over
    /// by a rotation. Non-retryable failures roll the reference back and are returned.
    pub(crate) async fn subscribe(
        &self,
        ident: &str,
        handler: Handler<K::Event>,
    ) -> Result<Subscription, SubscribeError> {
        let topic = K::topic(ident)?;
        let key: Arc<str> = Arc::from(ident);

        let (lineage, waiter) = loop {
            self.wait_gate().await?;
            let mut table = self.table.write().await;
            if !*self.params.gate.borrow() {
                continue;
            }
            if self.params.token.is_cancelled() {
                return Err(SubscribeError::ShutDown);
            }
            if let Some((_, wait)) = table.closing.get(&topic) {
                let wait = wait.clone();
                drop(table);
                tracing::debug!(topic, "waiting for teardown before rejoining");
                wait.await;
                continue;
            }

            let token = &self.params.token;
            let entry = table
                .entries
                .entry(topic.clone())
                .or_insert_with(|| ChannelEntry::new(Arc::clone(&key), token.child_token()));
            let refs = entry.attach(Arc::clone(&key), Arc::clone(&handler));
            let lineage = entry.id;

            let ready = match &entry.state {
                EntryState::Joined(ch) => Some(Waiter::Ready(Ok(JoinResolution::Joined(*ch)))),
                EntryState::Pending(fut) => Some(Waiter::Join(fut.clone())),
                EntryState::Error { retrying: true } => {
                    Some(Waiter::Ready(Ok(JoinResolution::Retrying)))
                }
                EntryState::Idle | EntryState::Error { retrying: false } => None,
            };
            let waiter = match ready {
                Some(w) => w,
                None => {
                    entry.attempts = 0;
                    let (_, fut) = entry.begin_attempt();
                    self.spawn_driver(&topic, lineage, entry.cancel.clone(), None);
                    Waiter::Join(fut)
                }
            };
            drop(table);

            tracing::debug!(topic, refs, "subscriber attached");
            self.params.bus.publish(
                Event::new(EventKind::SubscriberAttached)
                    .with_topic(topic.as_str())
                    .with_refs(refs),
            );
            break (lineage, waiter);
        };

        let outcome = match waiter {
            Waiter::Ready(outcome) => outcome,
            Waiter::Join(fut) => fut.await,
        };

        match outcome {
            Ok(resolution) => {
                let Some(me) = self.me.upgrade() else {
                    return Err(SubscribeError::ShutDown);
                };
                let owner = me as Arc<dyn Release>;
                Ok(Subscription::new(
                    topic.into(),
                    lineage,
                    resolution.channel(),
                    owner,
                ))
            }
            Err(e) => {
                tracing::debug!(topic, error = %e, "subscribe failed; rolling back reference");
                self.release_ref(&topic, lineage).await;
                Err(e)
            }
        }
    }

    /// Drops one reference of `lineage`; the last one closes the channel.
    async fn release_ref(&self, topic: &str, lineage: u64) {
        loop {
            if self.wait_gate().await.is_err() {
                return;
            }
            let mut table = self.table.write().await;
            if !*self.params.gate.borrow() {
                continue;
            }

            let Some(entry) = table
                .entries
                .get_mut(topic)
                .filter(|e| e.id == lineage)
            else {
                tracing::debug!(topic, "release of a stale subscription ignored");
                return;
            };
            let refs = entry.detach();
            self.params.bus.publish(
                Event::new(EventKind::SubscriberDetached)
                    .with_topic(topic)
                    .with_refs(refs),
            );
            if refs > 0 {
                return;
            }

            let closing = table.take_for_close(topic);
            drop(table);
            if let Some(closing) = closing {
                self.finish_close(closing, Teardown::Released).await;
            }
            return;
        }
    }

    /// Current state of `topic`, `Closed` while its teardown is in flight.
    pub(crate) async fn state(&self, topic: &str) -> Option<ChannelState> {
        let table = self.table.read().await;
        match table.entries.get(topic) {
            Some(entry) => Some(entry.public_state()),
            None if table.closing.contains_key(topic) => Some(ChannelState::Closed),
            None => None,
        }
    }

    /// Number of logical subscribers of `topic`.
    pub(crate) async fn ref_count(&self, topic: &str) -> usize {
        self.table
            .read()
            .await
            .entries
            .get(topic)
            .map_or(0, |e| e.refs)
    }

    /// Sorted list of tracked topics.
    pub(crate) async fn topics(&self) -> Vec<String> {
        let table = self.table.read().await;
        let mut topics: Vec<String> = table.entries.keys().cloned().collect();
        topics.sort_unstable();
        topics
    }

    fn spawn_driver(
        &self,
        topic: &str,
        lineage: u64,
        cancel: CancellationToken,
        delay: Option<Duration>,
    ) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let topic = topic.to_string();
        tokio::spawn(async move { me.drive(topic, lineage, cancel, delay).await });
    }

    /// Runs join attempts for one lineage until it joins, gives up, or is torn down.
    async fn drive(
        self: Arc<Self>,
        topic: String,
        lineage: u64,
        cancel: CancellationToken,
        mut delay: Option<Duration>,
    ) {
        loop {
            if let Some(d) = delay.take() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = time::sleep(d) => {}
                }
            }
            if !self.wait_throttle(&topic, &cancel).await {
                return;
            }

            let Some((generation, ident, attempt)) = self.start_attempt(&topic, lineage).await
            else {
                return;
            };
            tracing::debug!(topic, attempt, "opening channel");
            self.params.bus.publish(
                Event::new(EventKind::ChannelOpening)
                    .with_topic(topic.as_str())
                    .with_attempt(attempt),
            );

            let filter = K::filter(&ident);
            let (channel, signals) = match self.params.adapter.open(&topic, &filter).await {
                Ok(opened) => opened,
                Err(e) => match self.fail_attempt(&topic, lineage, generation, e).await {
                    Some(d) => {
                        delay = Some(d);
                        continue;
                    }
                    None => return,
                },
            };

            if !self.bind_channel(&topic, lineage, generation, channel).await {
                self.params.adapter.close(&topic, channel).await;
                return;
            }
            let pump = Arc::clone(&self);
            let (pump_topic, pump_cancel) = (topic.clone(), cancel.clone());
            tokio::spawn(async move {
                pump.pump(pump_topic, lineage, generation, signals, pump_cancel)
                    .await
            });

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                res = self.params.adapter.join(&topic, channel) => res,
            };
            match joined {
                Ok(()) => {
                    self.confirm_join(&topic, lineage, generation, channel, attempt)
                        .await;
                    return;
                }
                Err(e) => match self.fail_attempt(&topic, lineage, generation, e).await {
                    Some(d) => delay = Some(d),
                    None => return,
                },
            }
        }
    }

    /// Suspends until the join throttle lets `topic` join. False if cancelled meanwhile.
    async fn wait_throttle(&self, topic: &str, cancel: &CancellationToken) -> bool {
        loop {
            let remaining = self.params.throttle.lock().remaining(topic, Instant::now());
            let Some(wait) = remaining else {
                return true;
            };
            tracing::debug!(topic, wait_ms = wait.as_millis() as u64, "join throttled");
            self.params.bus.publish(
                Event::new(EventKind::JoinThrottled)
                    .with_topic(topic)
                    .with_delay(wait),
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = time::sleep(wait) => {}
            }
        }
    }

    /// Moves the entry into `Pending` (if a retry) and returns `(generation, ident, attempt)`.
    async fn start_attempt(&self, topic: &str, lineage: u64) -> Option<(u64, Arc<str>, u32)> {
        let mut table = self.table.write().await;
        let entry = table.entries.get_mut(topic).filter(|e| e.id == lineage)?;
        if !matches!(entry.state, EntryState::Pending(_)) {
            let _ = entry.begin_attempt();
        }
        Some((entry.generation, Arc::clone(&entry.ident), entry.attempts + 1))
    }

    async fn bind_channel(
        &self,
        topic: &str,
        lineage: u64,
        generation: u64,
        channel: ChannelHandle,
    ) -> bool {
        let mut table = self.table.write().await;
        match table
            .entries
            .get_mut(topic)
            .filter(|e| e.is_current(lineage, generation))
        {
            Some(entry) => {
                entry.channel = Some(channel);
                true
            }
            None => false,
        }
    }

    async fn confirm_join(
        &self,
        topic: &str,
        lineage: u64,
        generation: u64,
        channel: ChannelHandle,
        attempt: u32,
    ) {
        let mut table = self.table.write().await;
        let Some(entry) = table
            .entries
            .get_mut(topic)
            .filter(|e| e.is_current(lineage, generation))
        else {
            return;
        };
        entry.state = EntryState::Joined(channel);
        entry.backoff = None;
        entry.attempts = 0;
        entry.settle(Ok(JoinResolution::Joined(channel)));
        self.params.throttle.lock().record(topic, Instant::now());
        drop(table);

        tracing::debug!(topic, %channel, attempt, "channel joined");
        self.params.bus.publish(
            Event::new(EventKind::ChannelJoined)
                .with_topic(topic)
                .with_attempt(attempt),
        );
    }

    /// Records a failed attempt (join error or live channel error).
    ///
    /// Returns the sleep before the next attempt, or `None` when no retry follows.
    async fn fail_attempt(
        &self,
        topic: &str,
        lineage: u64,
        generation: u64,
        err: TransportError,
    ) -> Option<Duration> {
        let reason = format!("{}: {err}", err.as_label());
        let (next, channel) = {
            let mut table = self.table.write().await;
            let entry = table
                .entries
                .get_mut(topic)
                .filter(|e| e.is_current(lineage, generation))?;
            let channel = entry.abandon();
            entry.attempts += 1;
            let attempt = entry.attempts;

            tracing::debug!(topic, attempt, error = %err, "channel attempt failed");
            self.params.bus.publish(
                Event::new(EventKind::ChannelFailed)
                    .with_topic(topic)
                    .with_attempt(attempt)
                    .with_reason(reason.as_str()),
            );

            let next = if !err.is_retryable() {
                entry.state = EntryState::Error { retrying: false };
                entry.settle(Err(SubscribeError::Rejected {
                    topic: topic.into(),
                    error: err,
                }));
                None
            } else if self.params.max_retries.is_some_and(|max| attempt >= max) {
                entry.state = EntryState::Error { retrying: false };
                entry.settle(Err(SubscribeError::RetryExhausted {
                    topic: topic.into(),
                    attempts: attempt,
                }));
                self.params.bus.publish(
                    Event::new(EventKind::RetryExhausted)
                        .with_topic(topic)
                        .with_attempt(attempt),
                );
                None
            } else {
                let stored = self.params.backoff.next(entry.backoff);
                entry.backoff = Some(stored);
                entry.state = EntryState::Error { retrying: true };
                entry.settle(Ok(JoinResolution::Retrying));
                self.params.bus.publish(
                    Event::new(EventKind::BackoffScheduled)
                        .with_topic(topic)
                        .with_attempt(attempt)
                        .with_delay(stored)
                        .with_reason(reason.as_str()),
                );
                Some(self.params.backoff.delay_for(stored))
            };
            (next, channel)
        };

        if let Some(ch) = channel {
            self.params.adapter.close(topic, ch).await;
        }
        next
    }

    /// Handles a remote close. A joined entry is removed; a pending one retries.
    async fn remote_closed(&self, topic: &str, lineage: u64, generation: u64) -> Option<Duration> {
        let mut table = self.table.write().await;
        let pending = match table
            .entries
            .get(topic)
            .filter(|e| e.is_current(lineage, generation))
        {
            Some(entry) => matches!(entry.state, EntryState::Pending(_)),
            None => return None,
        };

        if pending {
            drop(table);
            let err = TransportError::connection("channel closed by remote before join");
            return self.fail_attempt(topic, lineage, generation, err).await;
        }

        let mut closing = table.take_for_close(topic)?;
        drop(table);
        closing.entry.channel = None;
        self.finish_close(closing, Teardown::Remote).await;
        None
    }

    /// Forwards the inbound traffic of one physical channel, in transport order.
    async fn pump(
        self: Arc<Self>,
        topic: String,
        lineage: u64,
        generation: u64,
        mut signals: mpsc::UnboundedReceiver<Signal>,
        cancel: CancellationToken,
    ) {
        loop {
            let signal = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                s = signals.recv() => match s {
                    Some(s) => s,
                    None => break,
                },
            };

            match signal {
                Signal::Message(raw) => {
                    let handlers = {
                        let table = self.table.read().await;
                        match table
                            .entries
                            .get(&topic)
                            .filter(|e| e.is_current(lineage, generation))
                        {
                            Some(entry) => entry.handlers(),
                            None => break,
                        }
                    };
                    if handlers.is_empty() {
                        continue;
                    }
                    let Some(event) = self.params.adapter.decode::<K>(&topic, raw) else {
                        continue;
                    };
                    for handler in &handlers {
                        deliver(&topic, handler, event.clone());
                    }
                }
                Signal::Error(err) => {
                    if let Some(d) = self.fail_attempt(&topic, lineage, generation, err).await {
                        self.spawn_driver(&topic, lineage, cancel.clone(), Some(d));
                    }
                    break;
                }
                Signal::Closed => {
                    if let Some(d) = self.remote_closed(&topic, lineage, generation).await {
                        self.spawn_driver(&topic, lineage, cancel.clone(), Some(d));
                    }
                    break;
                }
            }
        }
    }

    /// Cancels the entry's tasks, settles its waiters and closes its channel.
    async fn finish_close(&self, closing: Closing<K>, cause: Teardown) {
        let Closing {
            topic,
            mut entry,
            done,
        } = closing;

        entry.cancel.cancel();
        entry.settle(cause.outcome());
        if let Some(ch) = entry.channel.take() {
            self.params.adapter.close(&topic, ch).await;
        }

        let mut table = self.table.write().await;
        if table
            .closing
            .get(&topic)
            .is_some_and(|(id, _)| *id == entry.id)
        {
            table.closing.remove(&topic);
        }
        drop(table);
        let _ = done.send(());

        tracing::debug!(topic, cause = cause.as_label(), "channel closed");
        self.params.bus.publish(
            Event::new(EventKind::ChannelClosed)
                .with_topic(topic.as_str())
                .with_reason(cause.as_label()),
        );
    }

    /// Waits while a token rotation is running. Fails once the multiplexer shut down.
    async fn wait_gate(&self) -> Result<(), SubscribeError> {
        let mut gate = self.params.gate.clone();
        tokio::select! {
            biased;
            _ = self.params.token.cancelled() => Err(SubscribeError::ShutDown),
            res = gate.wait_for(|open| *open) => match res {
                Ok(_) => Ok(()),
                Err(_) => Err(SubscribeError::ShutDown),
            },
        }
    }
}

/// Invokes one handler; a panicking handler loses the payload but not the channel.
fn deliver<E>(topic: &str, handler: &Handler<E>, event: E) {
    let call = std::panic::AssertUnwindSafe(|| handler(event));
    if std::panic::catch_unwind(call).is_err() {
        tracing::warn!(topic, "handler panicked; payload dropped");
    }
}

#[async_trait]
impl<K: TopicKind> Release for Registry<K> {
    async fn release(&self, topic: &str, lineage: u64) {
        self.release_ref(topic, lineage).await;
    }
}

#[async_trait]
impl<K: TopicKind> Rotate for Registry<K> {
    async fn park(&self) -> usize {
        let closing = {
            let mut table = self.table.write().await;
            let mut closing = table.take_all_for_close();
            for c in &mut closing {
                table.parked.push(Parked {
                    topic: c.topic.clone(),
                    ident: Arc::clone(&c.entry.ident),
                    lineage: c.entry.id,
                    generation: c.entry.generation,
                    refs: c.entry.refs,
                    handlers: std::mem::take(&mut c.entry.handlers),
                });
            }
            closing
        };

        let parked = closing.len();
        join_all(
            closing
                .into_iter()
                .map(|c| self.finish_close(c, Teardown::Rotation)),
        )
        .await;
        parked
    }

    async fn restore(&self) -> usize {
        let mut table = self.table.write().await;
        let parked = std::mem::take(&mut table.parked);
        if self.params.token.is_cancelled() {
            return 0;
        }
        let mut restored = 0;

        for p in parked {
            if table.entries.contains_key(&p.topic) {
                continue;
            }
            let mut entry = ChannelEntry::<K>::with_lineage(
                p.lineage,
                p.generation,
                p.ident,
                self.params.token.child_token(),
            );
            entry.refs = p.refs;
            entry.handlers = p.handlers;
            let _ = entry.begin_attempt();

            self.params.throttle.lock().forget(&p.topic);
            self.spawn_driver(&p.topic, p.lineage, entry.cancel.clone(), None);
            table.entries.insert(p.topic, entry);
            restored += 1;
        }
        restored
    }

    async fn clear(&self, cause: Teardown) -> usize {
        let closing = {
            let mut table = self.table.write().await;
            table.parked.clear();
            table.take_all_for_close()
        };

        let cleared = closing.len();
        join_all(closing.into_iter().map(|c| self.finish_close(c, cause))).await;
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::TenantChannel;
    use crate::transport::{MemoryTransport, Transport};
    use serde_json::json;
    use tokio::sync::broadcast;

    struct Harness {
        registry: Arc<Registry<TenantChannel>>,
        transport: Arc<MemoryTransport>,
        gate: watch::Sender<bool>,
        events: broadcast::Receiver<Event>,
    }

    fn harness(max_retries: Option<u32>) -> Harness {
        let transport = Arc::new(MemoryTransport::new());
        let bus = Bus::new(256);
        let events = bus.subscribe();
        let (gate, gate_rx) = watch::channel(true);
        let inner: Arc<dyn Transport> = transport.clone();

        let registry = Registry::new(RegistryParams {
            adapter: TransportAdapter::new(inner, bus.clone(), None),
            bus,
            throttle: Arc::new(Mutex::new(JoinThrottle::new(Duration::from_secs(1)))),
            backoff: BackoffPolicy::default(),
            max_retries,
            gate: gate_rx,
            token: CancellationToken::new(),
        });
        Harness {
            registry,
            transport,
            gate,
            events,
        }
    }

    fn noop() -> Handler<<TenantChannel as TopicKind>::Event> {
        Arc::new(|_| {})
    }

    async fn next_of(rx: &mut broadcast::Receiver<Event>, kind: EventKind) -> Event {
        loop {
            let ev = rx.recv().await.expect("bus open");
            if ev.kind == kind {
                return ev;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_subscribes_share_one_join() {
        let h = harness(None);
        h.transport.hold_joins();

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let registry = Arc::clone(&h.registry);
            waiters.push(tokio::spawn(async move {
                registry.subscribe("t1", noop()).await
            }));
        }
        tokio::task::yield_now().await;
        h.transport.release_joins();

        let mut subs = Vec::new();
        for w in waiters {
            subs.push(w.await.unwrap().unwrap());
        }
        assert_eq!(h.transport.joins_for("posts:t1"), 1);
        assert_eq!(h.transport.opens(), 1);
        let channel = subs[0].channel();
        assert!(channel.is_some());
        assert!(subs.iter().all(|s| s.channel() == channel));
        assert_eq!(h.registry.ref_count("posts:t1").await, 5);

        for mut s in subs {
            s.unsubscribe().await;
        }
        assert_eq!(h.transport.closes_for("posts:t1"), 1);
        assert_eq!(h.registry.state("posts:t1").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_grows_then_resets() {
        let mut h = harness(None);
        for _ in 0..3 {
            h.transport
                .fail_next_join("posts:t1", TransportError::connection("refused"));
        }

        let sub = h.registry.subscribe("t1", noop()).await.unwrap();
        assert_eq!(sub.channel(), None);

        let mut delays = Vec::new();
        for _ in 0..3 {
            let ev = next_of(&mut h.events, EventKind::BackoffScheduled).await;
            delays.push(ev.delay_ms.unwrap());
        }
        assert_eq!(delays, vec![1000, 2000, 4000]);

        next_of(&mut h.events, EventKind::ChannelJoined).await;
        assert_eq!(h.registry.state("posts:t1").await, Some(ChannelState::Joined));

        h.transport
            .fail_channel("posts:t1", TransportError::Quota { reason: "rate".into() });
        let ev = next_of(&mut h.events, EventKind::BackoffScheduled).await;
        assert_eq!(ev.delay_ms, Some(1000));
        next_of(&mut h.events, EventKind::ChannelJoined).await;
        assert_eq!(h.registry.ref_count("posts:t1").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_rolls_back() {
        let h = harness(None);
        h.transport
            .fail_next_join("posts:t1", TransportError::rejected("forbidden"));

        let err = h.registry.subscribe("t1", noop()).await.unwrap_err();
        assert!(matches!(err, SubscribeError::Rejected { .. }));
        assert_eq!(h.registry.state("posts:t1").await, None);
        assert_eq!(h.transport.open_channels("posts:t1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_gives_up() {
        let mut h = harness(Some(2));
        h.transport
            .fail_next_join("posts:t1", TransportError::connection("refused"));
        h.transport
            .fail_next_join("posts:t1", TransportError::connection("refused"));

        let _sub = h.registry.subscribe("t1", noop()).await.unwrap();
        let ev = next_of(&mut h.events, EventKind::RetryExhausted).await;
        assert_eq!(ev.attempt, Some(2));
        assert_eq!(h.registry.state("posts:t1").await, Some(ChannelState::Error));
        assert_eq!(h.transport.joins_for("posts:t1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payloads_reach_handler_in_order() {
        let h = harness(None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = h
            .registry
            .subscribe(
                "t1",
                Arc::new(move |ev: crate::ChangeEvent<crate::Post>| {
                    sink.lock().push(ev.row().id.clone())
                }),
            )
            .await
            .unwrap();

        for id in ["p1", "p2", "p3"] {
            h.transport.emit(
                "posts:t1",
                json!({"eventType": "INSERT", "new": {"id": id, "tenant_id": "t1"}}),
            );
        }
        h.transport.emit("posts:t1", json!({"garbage": true}));

        for _ in 0..20 {
            if seen.lock().len() == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*seen.lock(), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_removes_entry() {
        let mut h = harness(None);
        let mut sub = h.registry.subscribe("t1", noop()).await.unwrap();

        h.transport.close_remote("posts:t1");
        let ev = next_of(&mut h.events, EventKind::ChannelClosed).await;
        assert_eq!(ev.reason.as_deref(), Some("remote"));
        assert_eq!(h.registry.state("posts:t1").await, None);

        sub.unsubscribe().await;
        assert_eq!(h.transport.closes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_waits_for_open_gate() {
        let h = harness(None);
        let mut sub = h.registry.subscribe("t1", noop()).await.unwrap();

        h.gate.send_replace(false);
        let release = tokio::spawn(async move { sub.unsubscribe().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.registry.ref_count("posts:t1").await, 1);

        h.gate.send_replace(true);
        release.await.unwrap();
        assert_eq!(h.registry.ref_count("posts:t1").await, 0);
    }
}
