//! # Lifecycle observers.
//!
//! This module provides the [`Subscribe`] trait, the [`SubscriberSet`] fan-out and the
//! built-in [`LogWriter`] for events broadcast through the [`Bus`](crate::events::Bus).
//!
//! ## Architecture
//! ```text
//! Registry / Rotation ── publish(Event) ──► Bus ──► observer_listener
//!                                                        │
//!                                                 SubscriberSet::emit
//!                                              ┌─────────┼─────────┐
//!                                              ▼         ▼         ▼
//!                                          LogWriter  Metrics   Custom
//! ```

mod embedded;
mod set;
mod subscriber;

pub use embedded::LogWriter;
pub use set::SubscriberSet;
pub use subscriber::Subscribe;
