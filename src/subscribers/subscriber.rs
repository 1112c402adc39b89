//! # Lifecycle observer trait.
//!
//! Provides [`Subscribe`] an extension point for plugging custom handlers of multiplexer
//! [`Event`]s (metrics, audit, debugging). It is unrelated to channel payload handlers:
//! observers see *what the multiplexer does*, never the change events themselves.
//!
//! Every observer is driven by its own worker task fed from a bounded queue sized by
//! [`Subscribe::queue_capacity`]. A full queue drops the event for that observer only and
//! a panic inside `on_event` is reported as `EventKind::SubscriberPanicked`.
//!
//! ## Example
//! ```rust
//! use async_trait::async_trait;
//! use chanvisor::{Subscribe, Event, EventKind};
//!
//! struct Retries;
//!
//! #[async_trait]
//! impl Subscribe for Retries {
//!     async fn on_event(&self, ev: &Event) {
//!         if matches!(ev.kind, EventKind::BackoffScheduled) {
//!             // export a metric, etc.
//!         }
//!     }
//!
//!     fn name(&self) -> &'static str { "retries" }
//! }
//! ```

use async_trait::async_trait;

use crate::events::Event;

/// Lifecycle event observer.
///
/// `on_event` runs on the observer's worker, so blocking it stalls that observer's queue
/// and nothing else. Keep I/O async.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Handles one event. Events reach an observer in publish order.
    async fn on_event(&self, event: &Event);

    /// Name reported in overflow and panic events.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Queue capacity for this observer, at least 1.
    fn queue_capacity(&self) -> usize {
        1024
    }
}
