//! # Topic kinds.
//!
//! A [`TopicKind`] is one flavor of realtime channel: it names topics from a logical id,
//! supplies the server-side row filter for them, and decodes raw transport payloads into a
//! closed, typed event. The registry is generic over the kind and never looks inside
//! payloads.

use std::fmt::Debug;

use serde_json::Value;

use crate::error::SubscribeError;
use crate::transport::ChannelFilter;

/// Separator between a kind prefix and the logical id.
pub const TOPIC_SEPARATOR: char = ':';

/// One family of realtime topics sharing a naming scheme and payload type.
pub trait TopicKind: Send + Sync + 'static {
    /// Typed payload delivered to handlers.
    type Event: Clone + Debug + Send + Sync + 'static;

    /// Topic prefix, e.g. `video_status`.
    const PREFIX: &'static str;

    /// Server-side predicate selecting the rows that belong to `id`.
    fn filter(id: &str) -> ChannelFilter;

    /// Decodes one raw inbound payload.
    fn decode(raw: Value) -> Result<Self::Event, serde_json::Error>;

    /// Builds the topic for `id`, rejecting ids that cannot form a stable key.
    fn topic(id: &str) -> Result<String, SubscribeError> {
        let topic = format!("{}{}{}", Self::PREFIX, TOPIC_SEPARATOR, id);
        let reason = if id.is_empty() {
            Some("empty id")
        } else if id.contains(TOPIC_SEPARATOR) {
            Some("id contains the topic separator")
        } else if id.chars().any(char::is_whitespace) {
            Some("id contains whitespace")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(SubscribeError::InvalidTopic {
                topic: topic.into(),
                reason: reason.into(),
            }),
            None => Ok(topic),
        }
    }
}
