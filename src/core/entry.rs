//! # Channel entry: per-topic bookkeeping.
//!
//! One [`ChannelEntry`] exists per subscribed topic. It carries the lifecycle state, the
//! reference count, the handler map and the retry bookkeeping of that topic.
//!
//! ## States
//! ```text
//!            subscribe                  join ok
//!   Idle ───────────────► Pending ───────────────► Joined
//!                           │  ▲                     │
//!                 join err  │  │ retry after backoff │ channel error
//!                           ▼  │                     │
//!                          Error ◄───────────────────┘
//!                  (retrying or terminal)
//! ```
//!
//! ## Rules
//! - `Pending` owns the one shared join future; every concurrent subscriber awaits it.
//! - `generation` increases with every attempt and on every failure, so signals and join
//!   results of an abandoned attempt are recognized as stale.
//! - `id` (lineage) is stable for the life of the logical subscription, including across
//!   token rotation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::SubscribeError;
use crate::topics::TopicKind;
use crate::transport::ChannelHandle;

static LINEAGE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Callback receiving the typed payloads of one topic.
pub(crate) type Handler<E> = Arc<dyn Fn(E) + Send + Sync>;

/// What a subscriber learns once the join it waited on settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinResolution {
    /// The channel is joined.
    Joined(ChannelHandle),
    /// The join failed with a retryable error; a retry is scheduled.
    Retrying,
    /// The attempt was abandoned by a token rotation; the subscription carries over.
    Superseded,
}

impl JoinResolution {
    pub(crate) fn channel(self) -> Option<ChannelHandle> {
        match self {
            JoinResolution::Joined(ch) => Some(ch),
            JoinResolution::Retrying | JoinResolution::Superseded => None,
        }
    }
}

pub(crate) type JoinOutcome = Result<JoinResolution, SubscribeError>;

/// Join future shared by every subscriber coalesced onto one attempt.
pub(crate) type JoinFuture = Shared<BoxFuture<'static, JoinOutcome>>;

/// Observable lifecycle state of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Tracked, no attempt started yet.
    Idle,
    /// A join is in flight (or waiting out the join throttle).
    Pending,
    /// Joined; payloads flow to the handler.
    Joined,
    /// The last attempt failed; a retry may be scheduled.
    Error,
    /// Being torn down.
    Closed,
}

pub(crate) enum EntryState {
    Idle,
    Pending(JoinFuture),
    Joined(ChannelHandle),
    Error { retrying: bool },
}

pub(crate) struct ChannelEntry<K: TopicKind> {
    /// Lineage id.
    pub(crate) id: u64,
    /// Logical id the topic was built from.
    pub(crate) ident: Arc<str>,
    pub(crate) generation: u64,
    pub(crate) state: EntryState,
    pub(crate) refs: usize,
    pub(crate) handlers: HashMap<Arc<str>, Handler<K::Event>>,
    /// Last scheduled retry delay; `None` means the next failure starts from the initial delay.
    pub(crate) backoff: Option<Duration>,
    /// Consecutive failed attempts.
    pub(crate) attempts: u32,
    pub(crate) channel: Option<ChannelHandle>,
    pub(crate) resolve: Option<oneshot::Sender<JoinOutcome>>,
    pub(crate) cancel: CancellationToken,
}

impl<K: TopicKind> ChannelEntry<K> {
    pub(crate) fn new(ident: Arc<str>, cancel: CancellationToken) -> Self {
        let id = LINEAGE_SEQ.fetch_add(1, Ordering::Relaxed);
        Self::with_lineage(id, 0, ident, cancel)
    }

    /// Recreates an entry that keeps an earlier lineage (token rotation).
    pub(crate) fn with_lineage(
        id: u64,
        generation: u64,
        ident: Arc<str>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            ident,
            generation,
            state: EntryState::Idle,
            refs: 0,
            handlers: HashMap::new(),
            backoff: None,
            attempts: 0,
            channel: None,
            resolve: None,
            cancel,
        }
    }

    /// Adds one reference and installs `handler` for `key`, replacing any previous one.
    pub(crate) fn attach(&mut self, key: Arc<str>, handler: Handler<K::Event>) -> usize {
        self.handlers.insert(key, handler);
        self.refs += 1;
        self.refs
    }

    /// Drops one reference; returns the remaining count.
    pub(crate) fn detach(&mut self) -> usize {
        self.refs = self.refs.saturating_sub(1);
        self.refs
    }

    /// Starts a new attempt: bumps the generation and stores a fresh shared join future.
    pub(crate) fn begin_attempt(&mut self) -> (u64, JoinFuture) {
        self.generation += 1;
        let (tx, rx) = oneshot::channel::<JoinOutcome>();
        let fut = async move { rx.await.unwrap_or(Err(SubscribeError::ShutDown)) }
            .boxed()
            .shared();

        if let Some(prev) = self.resolve.replace(tx) {
            let _ = prev.send(Ok(JoinResolution::Retrying));
        }
        self.state = EntryState::Pending(fut.clone());
        (self.generation, fut)
    }

    /// Resolves the waiters of the current attempt, if any.
    pub(crate) fn settle(&mut self, outcome: JoinOutcome) {
        if let Some(tx) = self.resolve.take() {
            let _ = tx.send(outcome);
        }
    }

    /// Invalidates the current attempt; returns its channel, if one was open.
    pub(crate) fn abandon(&mut self) -> Option<ChannelHandle> {
        self.generation += 1;
        self.channel.take()
    }

    pub(crate) fn is_current(&self, id: u64, generation: u64) -> bool {
        self.id == id && self.generation == generation
    }

    pub(crate) fn handlers(&self) -> Vec<Handler<K::Event>> {
        self.handlers.values().cloned().collect()
    }

    pub(crate) fn public_state(&self) -> ChannelState {
        match self.state {
            EntryState::Idle => ChannelState::Idle,
            EntryState::Pending(_) => ChannelState::Pending,
            EntryState::Joined(_) => ChannelState::Joined,
            EntryState::Error { .. } => ChannelState::Error,
        }
    }
}
