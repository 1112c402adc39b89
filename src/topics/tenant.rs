//! Per-tenant post feed (`posts:<tenantId>`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ChangeEvent, TopicKind};
use crate::transport::ChannelFilter;

/// A row of the `posts` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Topic kind for the per-tenant change feed.
pub struct TenantChannel;

impl TopicKind for TenantChannel {
    type Event = ChangeEvent<Post>;

    const PREFIX: &'static str = "posts";

    fn filter(id: &str) -> ChannelFilter {
        ChannelFilter::eq("posts", "tenant_id", id)
    }

    fn decode(raw: Value) -> Result<Self::Event, serde_json::Error> {
        serde_json::from_value(raw)
    }
}
