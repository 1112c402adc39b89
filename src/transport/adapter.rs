//! # Transport adapter.
//!
//! Thin wrapper over the shared [`Transport`] that turns raw transport behavior into the
//! contract the registry relies on:
//! - **Duplicate joins** (`AlreadyJoined`) are benign and reported as success.
//! - **Join timeout** (optional) wraps the join and maps expiry to a retryable
//!   [`TransportError::Timeout`].
//! - **Close** is best-effort: failures are logged and published, never returned.
//! - **Decoding** of inbound payloads into the topic kind's event type happens here, at
//!   the boundary; undecodable payloads are dropped.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time;

use super::{ChannelFilter, ChannelHandle, Signal, SignalSink, Transport};
use crate::error::TransportError;
use crate::events::{Bus, Event, EventKind};
use crate::topics::TopicKind;

/// Registry-facing view of the shared transport.
#[derive(Clone)]
pub(crate) struct TransportAdapter {
    inner: Arc<dyn Transport>,
    bus: Bus,
    join_timeout: Option<Duration>,
}

impl TransportAdapter {
    pub(crate) fn new(inner: Arc<dyn Transport>, bus: Bus, join_timeout: Option<Duration>) -> Self {
        Self {
            inner,
            bus,
            join_timeout,
        }
    }

    /// Opens a channel and returns its handle with the read side of its signal queue.
    pub(crate) async fn open(
        &self,
        topic: &str,
        filter: &ChannelFilter,
    ) -> Result<(ChannelHandle, mpsc::UnboundedReceiver<Signal>), TransportError> {
        let (sink, rx) = SignalSink::new();
        let channel = self.inner.open(topic, filter, sink).await?;
        Ok((channel, rx))
    }

    /// Joins `channel`, treating a duplicate join as success.
    pub(crate) async fn join(&self, topic: &str, channel: ChannelHandle) -> Result<(), TransportError> {
        let res = match self.join_timeout {
            Some(dur) => match time::timeout(dur, self.inner.join(channel)).await {
                Ok(r) => r,
                Err(_elapsed) => Err(TransportError::Timeout {
                    timeout_ms: dur.as_millis().min(u128::from(u64::MAX)) as u64,
                }),
            },
            None => self.inner.join(channel).await,
        };

        match res {
            Err(e) if e.is_duplicate_join() => {
                self.bus
                    .publish(Event::new(EventKind::DuplicateJoinIgnored).with_topic(topic));
                Ok(())
            }
            other => other,
        }
    }

    /// Closes `channel`; failures are logged and reported but never propagated.
    pub(crate) async fn close(&self, topic: &str, channel: ChannelHandle) {
        if let Err(e) = self.inner.close(channel).await {
            tracing::warn!(topic, %channel, error = %e, "closing channel failed; ignoring");
            self.bus.publish(
                Event::new(EventKind::CloseFailed)
                    .with_topic(topic)
                    .with_reason(format!("{}: {e}", e.as_label())),
            );
        }
    }

    /// Decodes a payload for kind `K`, dropping it (with a report) if it does not match.
    pub(crate) fn decode<K: TopicKind>(&self, topic: &str, raw: Value) -> Option<K::Event> {
        match K::decode(raw) {
            Ok(ev) => Some(ev),
            Err(e) => {
                tracing::warn!(topic, error = %e, "dropping undecodable payload");
                self.bus.publish(
                    Event::new(EventKind::DecodeFailed)
                        .with_topic(topic)
                        .with_reason(e.to_string()),
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::TenantChannel;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    fn adapter(transport: &Arc<MemoryTransport>, timeout: Option<Duration>) -> (TransportAdapter, Bus) {
        let bus = Bus::new(16);
        let inner: Arc<dyn Transport> = transport.clone();
        (TransportAdapter::new(inner, bus.clone(), timeout), bus)
    }

    #[tokio::test]
    async fn test_duplicate_join_is_swallowed() {
        let transport = Arc::new(MemoryTransport::new());
        let (adapter, bus) = adapter(&transport, None);
        let mut rx = bus.subscribe();

        transport.fail_next_join("posts:t1", TransportError::AlreadyJoined);
        let (ch, _signals) = adapter
            .open("posts:t1", &TenantChannel::filter("t1"))
            .await
            .unwrap();
        assert!(adapter.join("posts:t1", ch).await.is_ok());
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::DuplicateJoinIgnored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout_is_retryable() {
        let transport = Arc::new(MemoryTransport::new());
        transport.hold_joins();
        let (adapter, _bus) = adapter(&transport, Some(Duration::from_secs(2)));

        let (ch, _signals) = adapter
            .open("posts:t1", &TenantChannel::filter("t1"))
            .await
            .unwrap();
        let err = adapter.join("posts:t1", ch).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout { timeout_ms: 2000 });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_close_failure_is_reported_not_returned() {
        let transport = Arc::new(MemoryTransport::new());
        let (adapter, bus) = adapter(&transport, None);
        let mut rx = bus.subscribe();

        transport.fail_next_close("posts:t1", TransportError::connection("socket gone"));
        let (ch, _signals) = adapter
            .open("posts:t1", &TenantChannel::filter("t1"))
            .await
            .unwrap();
        adapter.close("posts:t1", ch).await;

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::CloseFailed);
        assert!(ev.reason.unwrap().contains("socket gone"));
    }

    #[test]
    fn test_decode_failure_drops_payload() {
        let transport = Arc::new(MemoryTransport::new());
        let (adapter, bus) = adapter(&transport, None);
        let mut rx = bus.subscribe();

        assert!(
            adapter
                .decode::<TenantChannel>("posts:t1", json!({"nope": 1}))
                .is_none()
        );
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::DecodeFailed);
    }
}
