//! # Realtime transport boundary.
//!
//! The multiplexer consumes the realtime client through the narrow [`Transport`] trait:
//! open a channel for a topic, join it, close it. Inbound traffic (payloads, asynchronous
//! errors, remote closure) is pushed by the transport into the [`SignalSink`] handed over
//! at open time; this replaces per-handle `onEvent` / `onError` / `onClose` callbacks and
//! keeps per-topic delivery order.
//!
//! ## Architecture
//! ```text
//! Registry ──► TransportAdapter ──► dyn Transport (socket client)
//!    ▲                                   │
//!    │            SignalSink             │  message / error / closed
//!    └──── pump task ◄── mpsc ◄──────────┘
//! ```
//!
//! - `TransportAdapter` classifies errors, swallows duplicate joins, applies the join
//!   timeout and makes close best-effort.
//! - [`MemoryTransport`] is an in-process loopback implementation.

mod adapter;
mod memory;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub(crate) use adapter::TransportAdapter;
pub use memory::MemoryTransport;

/// Opaque identifier of one physical channel, allocated by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// Server-side row predicate configured when a channel is opened.
///
/// Opaque to the multiplexer; transports translate it into their own subscription syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFilter {
    pub table: &'static str,
    pub column: &'static str,
    pub value: String,
}

impl ChannelFilter {
    /// Rows of `table` where `column == value`.
    pub fn eq(table: &'static str, column: &'static str, value: impl Into<String>) -> Self {
        Self {
            table,
            column,
            value: value.into(),
        }
    }
}

impl fmt::Display for ChannelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "postgres_changes:{}:{}=eq.{}",
            self.table, self.column, self.value
        )
    }
}

/// Inbound traffic of one physical channel.
#[derive(Debug, Clone)]
pub enum Signal {
    /// A payload matched the channel's filter.
    Message(Value),
    /// The channel failed after it was opened.
    Error(TransportError),
    /// The remote side closed the channel.
    Closed,
}

/// Write side of a channel's inbound queue, owned by the transport.
///
/// All methods are non-blocking and silently drop traffic once the multiplexer has
/// released the channel.
#[derive(Debug, Clone)]
pub struct SignalSink {
    tx: mpsc::UnboundedSender<Signal>,
}

impl SignalSink {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Delivers a payload.
    pub fn message(&self, payload: Value) {
        let _ = self.tx.send(Signal::Message(payload));
    }

    /// Reports an asynchronous channel failure.
    pub fn error(&self, err: TransportError) {
        let _ = self.tx.send(Signal::Error(err));
    }

    /// Reports remote closure.
    pub fn closed(&self) {
        let _ = self.tx.send(Signal::Closed);
    }

    /// True once the multiplexer stopped listening.
    pub fn is_released(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Capability interface of the realtime client.
///
/// One implementation is shared by every topic: the underlying socket is a process-wide
/// resource.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Creates a channel object for `topic`. Inbound traffic goes to `sink`.
    async fn open(
        &self,
        topic: &str,
        filter: &ChannelFilter,
        sink: SignalSink,
    ) -> Result<ChannelHandle, TransportError>;

    /// Activates the subscription on the server.
    async fn join(&self, channel: ChannelHandle) -> Result<(), TransportError>;

    /// Releases the channel.
    async fn close(&self, channel: ChannelHandle) -> Result<(), TransportError>;
}
