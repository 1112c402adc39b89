//! # Join throttle.
//!
//! [`JoinThrottle`] remembers when each topic last joined successfully and reports whether a
//! new join would fall inside the minimum interval. It absorbs mount/unmount/remount churn
//! (hot reload, double-invoked effects) so the transport does not see a burst of joins for
//! the same topic.
//!
//! ## Rules
//! - [`JoinThrottle::should_throttle`] and [`JoinThrottle::remaining`] are side-effect free.
//! - The caller records a join with [`JoinThrottle::record`] only after it **succeeded**.
//! - History survives entry teardown; it is dropped on sign-out ([`JoinThrottle::clear`]).

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Per-topic record of the last successful join.
#[derive(Debug, Clone)]
pub struct JoinThrottle {
    min_interval: Duration,
    last_join_at: HashMap<String, Instant>,
}

impl JoinThrottle {
    /// Creates a throttle with the given minimum interval between joins of one topic.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_join_at: HashMap::new(),
        }
    }

    /// The configured minimum interval.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// True if `now - last_join_at[topic] < min_interval`.
    pub fn should_throttle(&self, topic: &str, now: Instant) -> bool {
        self.remaining(topic, now).is_some()
    }

    /// Time left until `topic` may join again, or `None` if it may join now.
    pub fn remaining(&self, topic: &str, now: Instant) -> Option<Duration> {
        let last = self.last_join_at.get(topic)?;
        let elapsed = now.saturating_duration_since(*last);
        if elapsed < self.min_interval {
            Some(self.min_interval - elapsed)
        } else {
            None
        }
    }

    /// Records a successful join of `topic` at `now`.
    pub fn record(&mut self, topic: &str, now: Instant) {
        self.last_join_at.insert(topic.to_string(), now);
    }

    /// Drops the history of one topic.
    pub fn forget(&mut self, topic: &str) {
        self.last_join_at.remove(topic);
    }

    /// Drops all history.
    pub fn clear(&mut self) {
        self.last_join_at.clear();
    }
}
