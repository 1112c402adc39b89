//! # In-process loopback transport.
//!
//! [`MemoryTransport`] implements [`Transport`] without a socket. It keeps every open channel
//! in memory, lets the host inject payloads, failures and remote closures per topic, and
//! counts opens / joins / closes so churn can be observed.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use chanvisor::{MemoryTransport, TransportError};
//!
//! let transport = Arc::new(MemoryTransport::new());
//! transport.fail_next_join("posts:t1", TransportError::connection("refused"));
//! assert_eq!(transport.joins(), 0);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use super::{ChannelFilter, ChannelHandle, SignalSink, Transport};
use crate::error::TransportError;

struct MemChannel {
    topic: String,
    filter: ChannelFilter,
    sink: SignalSink,
    joined: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    channels: HashMap<u64, MemChannel>,
    join_failures: HashMap<String, VecDeque<TransportError>>,
    close_failures: HashMap<String, VecDeque<TransportError>>,
    joins_by_topic: HashMap<String, usize>,
    closes_by_topic: HashMap<String, usize>,
}

/// Loopback [`Transport`] with scripted failures and counters.
pub struct MemoryTransport {
    state: Mutex<State>,
    joins_open: watch::Sender<bool>,
    opens: AtomicUsize,
    joins: AtomicUsize,
    closes: AtomicUsize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Creates an empty transport whose joins succeed immediately.
    pub fn new() -> Self {
        let (joins_open, _) = watch::channel(true);
        Self {
            state: Mutex::new(State::default()),
            joins_open,
            opens: AtomicUsize::new(0),
            joins: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    /// Makes the next join of `topic` fail with `err` (queued, one per call).
    pub fn fail_next_join(&self, topic: &str, err: TransportError) {
        self.state
            .lock()
            .join_failures
            .entry(topic.to_string())
            .or_default()
            .push_back(err);
    }

    /// Makes the next close of a `topic` channel fail with `err`.
    pub fn fail_next_close(&self, topic: &str, err: TransportError) {
        self.state
            .lock()
            .close_failures
            .entry(topic.to_string())
            .or_default()
            .push_back(err);
    }

    /// Parks every join (current and future) until [`MemoryTransport::release_joins`].
    pub fn hold_joins(&self) {
        self.joins_open.send_replace(false);
    }

    /// Lets parked joins proceed.
    pub fn release_joins(&self) {
        self.joins_open.send_replace(true);
    }

    /// Delivers `payload` to every open channel of `topic`; returns how many received it.
    pub fn emit(&self, topic: &str, payload: Value) -> usize {
        let state = self.state.lock();
        let mut delivered = 0;
        for ch in state.channels.values().filter(|c| c.topic == topic) {
            ch.sink.message(payload.clone());
            delivered += 1;
        }
        delivered
    }

    /// Reports an asynchronous failure on every open channel of `topic`.
    pub fn fail_channel(&self, topic: &str, err: TransportError) {
        let state = self.state.lock();
        for ch in state.channels.values().filter(|c| c.topic == topic) {
            ch.sink.error(err.clone());
        }
    }

    /// Closes every channel of `topic` from the remote side.
    pub fn close_remote(&self, topic: &str) {
        let mut state = self.state.lock();
        state.channels.retain(|_, ch| {
            if ch.topic == topic {
                ch.sink.closed();
                false
            } else {
                true
            }
        });
    }

    /// Total `open` calls.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Total `join` calls.
    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    /// Total `close` calls.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// `join` calls for channels of `topic`.
    pub fn joins_for(&self, topic: &str) -> usize {
        self.state.lock().joins_by_topic.get(topic).copied().unwrap_or(0)
    }

    /// `close` calls for channels of `topic`.
    pub fn closes_for(&self, topic: &str) -> usize {
        self.state.lock().closes_by_topic.get(topic).copied().unwrap_or(0)
    }

    /// Number of currently open channels of `topic`.
    pub fn open_channels(&self, topic: &str) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .filter(|c| c.topic == topic)
            .count()
    }

    /// Filter the most recent open channel of `topic` was created with.
    pub fn filter_of(&self, topic: &str) -> Option<ChannelFilter> {
        let state = self.state.lock();
        state
            .channels
            .iter()
            .filter(|(_, c)| c.topic == topic)
            .max_by_key(|(id, _)| **id)
            .map(|(_, c)| c.filter.clone())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(
        &self,
        topic: &str,
        filter: &ChannelFilter,
        sink: SignalSink,
    ) -> Result<ChannelHandle, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.channels.insert(
            id,
            MemChannel {
                topic: topic.to_string(),
                filter: filter.clone(),
                sink,
                joined: false,
            },
        );
        Ok(ChannelHandle(id))
    }

    async fn join(&self, channel: ChannelHandle) -> Result<(), TransportError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            if let Some(topic) = state.channels.get(&channel.0).map(|c| c.topic.clone()) {
                *state.joins_by_topic.entry(topic).or_default() += 1;
            }
        }

        let mut open = self.joins_open.subscribe();
        let _ = open.wait_for(|open| *open).await;

        let mut state = self.state.lock();
        let Some(topic) = state.channels.get(&channel.0).map(|c| c.topic.clone()) else {
            return Err(TransportError::rejected(format!("unknown channel {channel}")));
        };
        if let Some(err) = state
            .join_failures
            .get_mut(&topic)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let Some(ch) = state.channels.get_mut(&channel.0) else {
            return Err(TransportError::rejected(format!("unknown channel {channel}")));
        };
        if ch.joined {
            return Err(TransportError::AlreadyJoined);
        }
        ch.joined = true;
        Ok(())
    }

    async fn close(&self, channel: ChannelHandle) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let Some(ch) = state.channels.remove(&channel.0) else {
            return Ok(());
        };
        *state.closes_by_topic.entry(ch.topic.clone()).or_default() += 1;
        match state
            .close_failures
            .get_mut(&ch.topic)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
