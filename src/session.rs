//! Session lifecycle events consumed by the multiplexer.
//!
//! The session provider publishes these on a `tokio::sync::broadcast` channel; hand the
//! receiver to [`Multiplexer::attach_session`](crate::Multiplexer::attach_session), or call
//! [`Multiplexer::on_session_event`](crate::Multiplexer::on_session_event) directly.

use serde::{Deserialize, Serialize};

/// Authentication state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    /// The access token was replaced; channels must be rejoined with the new credentials.
    TokenRefreshed,
    /// The session ended; every channel is dropped.
    SignedOut,
}
