//! Retry and join policies.
//!
//! This module groups the knobs that control **how long** to wait before re-joining a
//! failed channel and **how often** one topic may join.
//!
//! ## Contents
//! - [`BackoffPolicy`] how retry delays evolve (first / factor / max + jitter)
//! - [`JitterPolicy`]  randomization strategy to avoid synchronized re-joins
//! - [`JoinThrottle`]  minimum interval between successful joins of one topic
//!
//! ## Quick wiring
//! ```text
//! Config { backoff, min_join_interval, .. }
//!      └─► core::registry::Registry uses:
//!           - backoff.next(current) after each retryable error
//!           - throttle.remaining(topic) before opening a channel
//! ```
//!
//! ## Defaults
//! - `BackoffPolicy::default()` → first=1s, factor=2.0, max=30s, jitter=None.
//! - `min_join_interval = 1s`.

mod backoff;
mod jitter;
mod throttle;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use throttle::JoinThrottle;
