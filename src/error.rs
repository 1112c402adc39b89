//! Error types used by the multiplexer and its transport boundary.
//!
//! This module defines two main error enums:
//!
//! - [`TransportError`]: failures reported by the realtime transport (open, join, close,
//!   or asynchronously on a live channel).
//! - [`SubscribeError`]: failures surfaced to a caller of `subscribe`.
//!
//! Both types provide `as_label` for logging/metrics. [`TransportError::is_retryable`]
//! drives the registry's retry decision.

use std::sync::Arc;

use thiserror::Error;

/// # Errors produced by the realtime transport.
///
/// Retryable classes (connection limits, quota, connection, timeout, unknown) feed the
/// backoff loop and are never shown to subscribers. Non-retryable classes (invalid topic,
/// rejection) are surfaced to the subscribing caller. [`TransportError::AlreadyJoined`]
/// is a benign duplicate-join artifact and is swallowed by the adapter.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Too many concurrent channels on the connection.
    #[error("connection limit reached: {reason}")]
    ConnectionLimit {
        /// Transport-provided detail.
        reason: Arc<str>,
    },

    /// Rate or message quota exceeded.
    #[error("quota exceeded: {reason}")]
    Quota {
        /// Transport-provided detail.
        reason: Arc<str>,
    },

    /// Socket-level failure (dropped, refused, reset).
    #[error("connection error: {reason}")]
    Connection {
        /// Transport-provided detail.
        reason: Arc<str>,
    },

    /// Join did not complete within the configured join timeout.
    #[error("join timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// Unclassified transient failure.
    #[error("transport error: {reason}")]
    Unknown {
        /// Transport-provided detail.
        reason: Arc<str>,
    },

    /// Channel is already joined or joining.
    #[error("channel already joined")]
    AlreadyJoined,

    /// Topic was refused as malformed.
    #[error("invalid topic {topic:?}: {reason}")]
    InvalidTopic {
        /// The offending topic.
        topic: Arc<str>,
        /// Transport-provided detail.
        reason: Arc<str>,
    },

    /// The server refused the subscription (authorization, programmer error).
    #[error("subscription rejected: {reason}")]
    Rejected {
        /// Transport-provided detail.
        reason: Arc<str>,
    },
}

impl TransportError {
    /// Convenience constructor for [`TransportError::Connection`].
    pub fn connection(reason: impl Into<Arc<str>>) -> Self {
        TransportError::Connection {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`TransportError::Rejected`].
    pub fn rejected(reason: impl Into<Arc<str>>) -> Self {
        TransportError::Rejected {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use chanvisor::TransportError;
    ///
    /// let err = TransportError::Quota { reason: "too many messages".into() };
    /// assert_eq!(err.as_label(), "transport_quota");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TransportError::ConnectionLimit { .. } => "transport_connection_limit",
            TransportError::Quota { .. } => "transport_quota",
            TransportError::Connection { .. } => "transport_connection",
            TransportError::Timeout { .. } => "transport_timeout",
            TransportError::Unknown { .. } => "transport_unknown",
            TransportError::AlreadyJoined => "transport_already_joined",
            TransportError::InvalidTopic { .. } => "transport_invalid_topic",
            TransportError::Rejected { .. } => "transport_rejected",
        }
    }

    /// Indicates whether the failure is transient and the join should be retried.
    ///
    /// # Example
    /// ```
    /// use chanvisor::TransportError;
    ///
    /// assert!(TransportError::connection("reset by peer").is_retryable());
    /// assert!(!TransportError::rejected("forbidden").is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLimit { .. }
                | TransportError::Quota { .. }
                | TransportError::Connection { .. }
                | TransportError::Timeout { .. }
                | TransportError::Unknown { .. }
        )
    }

    /// True for the benign "already joined / joining" artifact.
    pub fn is_duplicate_join(&self) -> bool {
        matches!(self, TransportError::AlreadyJoined)
    }
}

/// # Errors returned to a subscribing caller.
///
/// `Clone` because one join outcome is shared by every caller coalesced onto it.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// The logical id does not form a valid topic (empty, or contains the separator).
    #[error("invalid topic {topic:?}: {reason}")]
    InvalidTopic {
        /// The rejected topic string.
        topic: Arc<str>,
        /// Why it was rejected.
        reason: Arc<str>,
    },

    /// The transport failed the join with a non-retryable error.
    #[error("join of {topic:?} failed: {error}")]
    Rejected {
        /// Topic whose join failed.
        topic: Arc<str>,
        /// Underlying transport error.
        error: TransportError,
    },

    /// The configured retry ceiling was reached before the channel joined.
    #[error("gave up joining {topic:?} after {attempts} attempts")]
    RetryExhausted {
        /// Topic that gave up.
        topic: Arc<str>,
        /// Number of failed attempts.
        attempts: u32,
    },

    /// The session ended while the join was in flight.
    #[error("signed out")]
    SignedOut,

    /// The multiplexer was shut down.
    #[error("multiplexer shut down")]
    ShutDown,
}

impl SubscribeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use chanvisor::SubscribeError;
    ///
    /// assert_eq!(SubscribeError::SignedOut.as_label(), "subscribe_signed_out");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            SubscribeError::InvalidTopic { .. } => "subscribe_invalid_topic",
            SubscribeError::Rejected { .. } => "subscribe_rejected",
            SubscribeError::RetryExhausted { .. } => "subscribe_retry_exhausted",
            SubscribeError::SignedOut => "subscribe_signed_out",
            SubscribeError::ShutDown => "subscribe_shut_down",
        }
    }

    /// Returns the topic the error refers to, when there is one.
    pub fn topic(&self) -> Option<&str> {
        match self {
            SubscribeError::InvalidTopic { topic, .. }
            | SubscribeError::Rejected { topic, .. }
            | SubscribeError::RetryExhausted { topic, .. } => Some(topic),
            SubscribeError::SignedOut | SubscribeError::ShutDown => None,
        }
    }
}
