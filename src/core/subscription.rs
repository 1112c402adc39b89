//! # Subscription disposer.
//!
//! A [`Subscription`] stands for one logical reference on a topic. Releasing it (explicitly
//! with [`Subscription::unsubscribe`] or implicitly on drop) decrements the topic's
//! reference count; the last release closes the physical channel.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::transport::ChannelHandle;

/// Owner of the entry a subscription refers to.
#[async_trait]
pub(crate) trait Release: Send + Sync {
    /// Drops one reference of lineage `lineage` on `topic`. No-op if that lineage is gone.
    async fn release(&self, topic: &str, lineage: u64);
}

/// Handle to one logical subscription.
///
/// Dropping an active subscription releases it in the background (when a tokio runtime is
/// available); call [`Subscription::unsubscribe`] to release it deterministically.
#[must_use = "dropping a Subscription releases it immediately"]
pub struct Subscription {
    topic: Arc<str>,
    lineage: u64,
    channel: Option<ChannelHandle>,
    owner: Option<Arc<dyn Release>>,
}

impl Subscription {
    pub(crate) fn new(
        topic: Arc<str>,
        lineage: u64,
        channel: Option<ChannelHandle>,
        owner: Arc<dyn Release>,
    ) -> Self {
        Self {
            topic,
            lineage,
            channel,
            owner: Some(owner),
        }
    }

    /// Topic this subscription holds.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Channel the subscription resolved to, if the join had completed when it was returned.
    ///
    /// `None` when the join was still retrying or was carried over by a token rotation.
    pub fn channel(&self) -> Option<ChannelHandle> {
        self.channel
    }

    /// False once released.
    pub fn is_active(&self) -> bool {
        self.owner.is_some()
    }

    /// Releases the subscription. Calling it again is a no-op.
    pub async fn unsubscribe(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.release(&self.topic, self.lineage).await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(owner) = self.owner.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let topic = Arc::clone(&self.topic);
                let lineage = self.lineage;
                rt.spawn(async move { owner.release(&topic, lineage).await });
            }
            Err(_) => {
                tracing::warn!(topic = %self.topic, "subscription dropped outside a runtime; not released");
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("lineage", &self.lineage)
            .field("channel", &self.channel)
            .field("active", &self.is_active())
            .finish()
    }
}
