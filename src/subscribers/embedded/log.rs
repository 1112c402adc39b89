//! # LogWriter: tracing-backed event renderer
//!
//! A minimal observer that forwards incoming [`Event`]s to `tracing`. Failures and
//! give-ups are logged at `warn`, the rest at `debug`.
//!
//! ## Example output
//! ```text
//! DEBUG chanvisor: opening topic="posts:t1" attempt=1
//! WARN  chanvisor: channel failed topic="posts:t1" attempt=1 err="transport_connection: reset"
//! DEBUG chanvisor: backoff topic="posts:t1" delay_ms=1000 after_attempt=1
//! DEBUG chanvisor: joined topic="posts:t1" attempt=2
//! DEBUG chanvisor: rotation finished topics=2
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer observer.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let topic = e.topic.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("");
        match e.kind {
            EventKind::ChannelOpening => {
                tracing::debug!(target: "chanvisor", topic, attempt = ?e.attempt, "opening");
            }
            EventKind::JoinThrottled => {
                tracing::debug!(target: "chanvisor", topic, delay_ms = ?e.delay_ms, "join throttled");
            }
            EventKind::ChannelJoined => {
                tracing::debug!(target: "chanvisor", topic, attempt = ?e.attempt, "joined");
            }
            EventKind::DuplicateJoinIgnored => {
                tracing::debug!(target: "chanvisor", topic, "duplicate join ignored");
            }
            EventKind::ChannelFailed => {
                tracing::warn!(target: "chanvisor", topic, attempt = ?e.attempt, err = reason, "channel failed");
            }
            EventKind::BackoffScheduled => {
                tracing::debug!(
                    target: "chanvisor",
                    topic,
                    delay_ms = ?e.delay_ms,
                    after_attempt = ?e.attempt,
                    "backoff"
                );
            }
            EventKind::RetryExhausted => {
                tracing::warn!(target: "chanvisor", topic, attempts = ?e.attempt, "retry exhausted");
            }
            EventKind::ChannelClosed => {
                tracing::debug!(target: "chanvisor", topic, cause = reason, "closed");
            }
            EventKind::CloseFailed => {
                tracing::warn!(target: "chanvisor", topic, err = reason, "close failed");
            }
            EventKind::DecodeFailed => {
                tracing::warn!(target: "chanvisor", topic, err = reason, "undecodable payload dropped");
            }
            EventKind::SubscriberAttached | EventKind::SubscriberDetached => {
                tracing::trace!(target: "chanvisor", topic, refs = ?e.refs, kind = ?e.kind);
            }
            EventKind::RotationStarted => {
                tracing::debug!(target: "chanvisor", topics = ?e.refs, "rotation started");
            }
            EventKind::RotationCollapsed => {
                tracing::debug!(target: "chanvisor", "token refresh folded into running rotation");
            }
            EventKind::RotationFinished => {
                tracing::debug!(target: "chanvisor", topics = ?e.refs, "rotation finished");
            }
            EventKind::SignedOut => {
                tracing::debug!(target: "chanvisor", "signed out; all channels cleared");
            }
            EventKind::SubscriberOverflow => {
                tracing::warn!(target: "chanvisor", observer = topic, reason, "observer overflow");
            }
            EventKind::SubscriberPanicked => {
                tracing::error!(target: "chanvisor", observer = topic, info = reason, "observer panicked");
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
