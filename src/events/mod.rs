//! Lifecycle events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to publish and
//! observe what the multiplexer does with each topic.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Registry`, join drivers, `TransportAdapter`, `RotationCoordinator`,
//!   `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: `Multiplexer::observer_listener()` (fans out to `SubscriberSet`) and
//!   anyone holding [`Multiplexer::events`](crate::Multiplexer::events).

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
