//! # Lifecycle events emitted by the multiplexer.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Channel events**: the per-topic join state machine (opening, joined, failed, closed)
//! - **Subscriber events**: logical subscribers attaching to and detaching from a topic
//! - **Session events**: token rotation and sign-out
//! - **Observer events**: overflow/panic of an observer queue
//!
//! The [`Event`] struct carries metadata such as timestamps, topic, reasons and delays.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use chanvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::BackoffScheduled)
//!     .with_topic("posts:t1")
//!     .with_attempt(3)
//!     .with_delay(Duration::from_secs(4))
//!     .with_reason("connection reset");
//!
//! assert_eq!(ev.kind, EventKind::BackoffScheduled);
//! assert_eq!(ev.topic.as_deref(), Some("posts:t1"));
//! assert_eq!(ev.delay_ms, Some(4000));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of multiplexer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Observer events ===
    /// Observer panicked during event processing.
    ///
    /// Sets: `topic` (observer name), `reason` (panic message).
    SubscriberPanicked,

    /// Observer dropped an event (queue full or worker closed).
    ///
    /// Sets: `topic` (observer name), `reason`.
    SubscriberOverflow,

    // === Channel lifecycle ===
    /// A physical channel is being opened for a topic.
    ///
    /// Sets: `topic`, `attempt` (1-based since the last successful join).
    ChannelOpening,

    /// The join was deferred by the join throttle.
    ///
    /// Sets: `topic`, `delay_ms` (remaining interval).
    JoinThrottled,

    /// The transport confirmed the join.
    ///
    /// Sets: `topic`, `attempt`.
    ChannelJoined,

    /// The transport reported a duplicate join; treated as joined.
    ///
    /// Sets: `topic`.
    DuplicateJoinIgnored,

    /// A join attempt or a live channel failed.
    ///
    /// Sets: `topic`, `attempt`, `reason` (error label and message).
    ChannelFailed,

    /// A retry was scheduled after a retryable failure.
    ///
    /// Sets: `topic`, `attempt` (failed attempt), `delay_ms`, `reason`.
    BackoffScheduled,

    /// The retry ceiling was reached; the topic stays in the error state.
    ///
    /// Sets: `topic`, `attempt`.
    RetryExhausted,

    /// The physical channel was closed and the entry removed.
    ///
    /// Sets: `topic`, `reason` (`released`, `remote`, `rotation`, `signed_out`, `shutdown`).
    ChannelClosed,

    /// Closing the physical channel failed (ignored).
    ///
    /// Sets: `topic`, `reason`.
    CloseFailed,

    /// An inbound payload could not be decoded into the topic's event type.
    ///
    /// Sets: `topic`, `reason`.
    DecodeFailed,

    // === Subscriber bookkeeping ===
    /// A logical subscriber attached to a topic.
    ///
    /// Sets: `topic`, `refs` (count after attach).
    SubscriberAttached,

    /// A logical subscriber released a topic.
    ///
    /// Sets: `topic`, `refs` (count after release).
    SubscriberDetached,

    // === Session ===
    /// Token rotation started.
    ///
    /// Sets: `refs` (number of topics parked).
    RotationStarted,

    /// A token refresh arrived while a rotation was running and was folded into it.
    RotationCollapsed,

    /// Token rotation re-issued every parked topic.
    ///
    /// Sets: `refs` (number of topics restored).
    RotationFinished,

    /// Session ended; every channel was torn down.
    SignedOut,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Topic (or observer name for observer events).
    pub topic: Option<Arc<str>>,
    /// Attempt count since the last successful join (starting from 1).
    pub attempt: Option<u32>,
    /// Delay in milliseconds (backoff or throttle).
    pub delay_ms: Option<u32>,
    /// Reference count after the change, or topic count for rotation events.
    pub refs: Option<u32>,
    /// Human-readable reason (errors, close cause, etc.).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            topic: None,
            attempt: None,
            delay_ms: None,
            refs: None,
            reason: None,
        }
    }

    /// Attaches a topic.
    #[inline]
    pub fn with_topic(mut self, topic: impl Into<Arc<str>>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches an attempt count.
    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        let ms = d.as_millis().min(u128::from(u32::MAX)) as u32;
        self.delay_ms = Some(ms);
        self
    }

    /// Attaches a reference (or topic) count.
    #[inline]
    pub fn with_refs(mut self, n: usize) -> Self {
        self.refs = Some(n.min(u32::MAX as usize) as u32);
        self
    }

    /// Creates an observer overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_topic(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates an observer panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_topic(subscriber)
            .with_reason(info)
    }
}
