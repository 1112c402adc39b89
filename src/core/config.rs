//! # Multiplexer configuration.
//!
//! Provides [`Config`], the settings shared by every registry of one [`Multiplexer`](crate::Multiplexer).
//!
//! ## Sentinel values
//! - `join_timeout = 0s` → joins may stay pending indefinitely
//! - `max_retries = 0` → retryable failures are retried forever

use std::time::Duration;

use crate::policies::BackoffPolicy;

/// Settings for the multiplexer runtime.
///
/// ## Field semantics
/// - `backoff`: retry delay growth after retryable failures
/// - `min_join_interval`: minimum spacing of two joins of one topic
/// - `settle_delay`: pause between teardown and rejoin during token rotation
/// - `join_timeout`: bound on a single join attempt (`0s` = none)
/// - `max_retries`: consecutive failed attempts before giving up (`0` = unlimited)
/// - `bus_capacity`: event bus ring buffer size (min 1; clamped by Bus)
///
/// ## Notes
/// All fields are public. Prefer the accessors over checking the `0` sentinels directly.
#[derive(Clone, Debug)]
pub struct Config {
    /// Retry backoff for retryable transport failures.
    pub backoff: BackoffPolicy,

    /// Minimum time between two successful joins of the same topic.
    pub min_join_interval: Duration,

    /// Time to let the transport release sockets before rejoining after a token refresh.
    pub settle_delay: Duration,

    /// Upper bound on one join attempt.
    ///
    /// - `Duration::ZERO` = no bound
    /// - `> 0` = expiry counts as a retryable failure
    pub join_timeout: Duration,

    /// Consecutive failed attempts after which a topic stops retrying.
    ///
    /// - `0` = retry indefinitely
    /// - `n > 0` = the `n`-th consecutive failure is final
    pub max_retries: u32,

    /// Capacity of the event bus broadcast channel ring buffer.
    pub bus_capacity: usize,
}

impl Config {
    /// Returns the join timeout as an `Option`.
    #[inline]
    pub fn join_deadline(&self) -> Option<Duration> {
        if self.join_timeout == Duration::ZERO {
            None
        } else {
            Some(self.join_timeout)
        }
    }

    /// Returns the retry ceiling as an `Option`.
    #[inline]
    pub fn retry_limit(&self) -> Option<u32> {
        match self.max_retries {
            0 => None,
            n => Some(n),
        }
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `backoff = BackoffPolicy::default()` (1s doubling, 30s cap)
    /// - `min_join_interval = 1s`
    /// - `settle_delay = 500ms`
    /// - `join_timeout = 0s` (none)
    /// - `max_retries = 0` (unlimited)
    /// - `bus_capacity = 1024`
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            min_join_interval: Duration::from_secs(1),
            settle_delay: Duration::from_millis(500),
            join_timeout: Duration::ZERO,
            max_retries: 0,
            bus_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        let mut cfg = Config::default();
        assert_eq!(cfg.join_deadline(), None);
        assert_eq!(cfg.retry_limit(), None);

        cfg.join_timeout = Duration::from_secs(5);
        cfg.max_retries = 3;
        cfg.bus_capacity = 0;
        assert_eq!(cfg.join_deadline(), Some(Duration::from_secs(5)));
        assert_eq!(cfg.retry_limit(), Some(3));
        assert_eq!(cfg.bus_capacity_clamped(), 1);
    }
}
