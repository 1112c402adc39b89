//! # Backoff policy for re-joining failed channels.
//!
//! [`BackoffPolicy`] controls how the retry delay of one topic grows after consecutive
//! retryable transport errors. It is parameterized by:
//! - [`BackoffPolicy::first`] the initial delay;
//! - [`BackoffPolicy::max`] the maximum delay cap;
//! - [`BackoffPolicy::factor`] the multiplicative growth factor.
//!
//! The stored delay advances as `min(current × factor, max)` and resets to `first` on a
//! successful join. Jitter is applied only to the sleep that is actually scheduled
//! ([`BackoffPolicy::delay_for`]); the jittered value never feeds back into the stored
//! delay, so the stored sequence is non-decreasing and capped.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use chanvisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_secs(1),
//!     max: Duration::from_secs(30),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(None), Duration::from_secs(1));
//! assert_eq!(backoff.next(Some(Duration::from_secs(1))), Duration::from_secs(2));
//! assert_eq!(backoff.next(Some(Duration::from_secs(20))), Duration::from_secs(30));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Retry backoff policy.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first retry, and the value restored after a successful join.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
    /// Randomization applied to scheduled sleeps.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Returns a doubling strategy with:
    /// - `first = 1s`;
    /// - `max = 30s`;
    /// - `factor = 2.0`;
    /// - `jitter = None`.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// The initial delay, clamped to [`BackoffPolicy::max`].
    #[inline]
    pub fn initial(&self) -> Duration {
        self.first.min(self.max)
    }

    /// Computes the delay that follows `current`.
    ///
    /// `None` yields the initial delay. Otherwise the result is `current × factor`,
    /// clamped to [`BackoffPolicy::max`]. Non-finite or negative products clamp to `max`.
    pub fn next(&self, current: Option<Duration>) -> Duration {
        let Some(current) = current else {
            return self.initial();
        };

        let secs = current.as_secs_f64() * self.factor;
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Returns the sleep to schedule for a stored delay, with jitter applied.
    #[inline]
    pub fn delay_for(&self, current: Duration) -> Duration {
        self.jitter.apply(current.min(self.max))
    }
}
