//! # Event bus for broadcasting lifecycle events.
//!
//! [`Bus`] is a thin wrapper around [`tokio::sync::broadcast`] that provides
//! non-blocking event publishing from multiple sources (registries, join drivers,
//! the rotation coordinator, observer workers).
//!
//! ## Architecture
//! ```text
//! Publishers (many):                    Consumer (one):
//!   Registry<User>   ──┐
//!   Registry<Tenant> ──┼──────► Bus ───────► observer_listener ────► SubscriberSet
//!   JoinDriver       ──┤  (broadcast chan)     (in Multiplexer)
//!   Rotation         ──┘
//! ```
//!
//! Publishing never blocks and never fails: with no receiver the event is dropped, and a
//! receiver that falls more than `capacity` events behind sees `RecvError::Lagged` and
//! resumes from the oldest retained event. Registries publish while holding their table
//! lock, which is why publishing must stay synchronous.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for lifecycle events. Clones share one ring buffer.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a new bus with the given channel capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel::<Event>(capacity);
        Self { tx }
    }

    /// Publishes an event to all active receivers.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Number of live receivers (observer listener plus `Multiplexer::events` handles).
    pub fn receivers(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Creates a new receiver that will observe subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn test_publish_reaches_receiver() {
        let bus = Bus::new(0);
        let mut rx = bus.subscribe();
        bus.publish(Event::new(EventKind::SignedOut));
        let ev = rx.recv().await.expect("event");
        assert_eq!(ev.kind, EventKind::SignedOut);
    }

    #[test]
    fn test_publish_without_receivers_is_noop() {
        let bus = Bus::new(4);
        bus.publish(Event::new(EventKind::RotationCollapsed));
        let rx = bus.subscribe();
        assert_eq!(bus.receivers(), 1);
        drop(rx);
        assert_eq!(bus.receivers(), 0);
    }
}
