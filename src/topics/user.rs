//! Per-user video processing status feed (`video_status:<userId>`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ChangeEvent, TopicKind};
use crate::transport::ChannelFilter;

/// Processing state of one uploaded video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoState {
    Queued,
    Processing,
    Ready,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A row of the `video_status` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStatus {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub status: VideoState,
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Topic kind for the per-user change feed.
pub struct UserChannel;

impl TopicKind for UserChannel {
    type Event = ChangeEvent<VideoStatus>;

    const PREFIX: &'static str = "video_status";

    fn filter(id: &str) -> ChannelFilter {
        ChannelFilter::eq("video_status", "user_id", id)
    }

    fn decode(raw: Value) -> Result<Self::Event, serde_json::Error> {
        serde_json::from_value(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubscribeError;
    use serde_json::json;

    #[test]
    fn test_topic_naming_and_validation() {
        assert_eq!(UserChannel::topic("u1").unwrap(), "video_status:u1");
        assert!(matches!(
            UserChannel::topic(""),
            Err(SubscribeError::InvalidTopic { .. })
        ));
        assert!(matches!(
            UserChannel::topic("u:1"),
            Err(SubscribeError::InvalidTopic { .. })
        ));
        assert!(UserChannel::topic("u 1").is_err());
    }

    #[test]
    fn test_decode_update_with_unknown_state() {
        let ev = UserChannel::decode(json!({
            "eventType": "UPDATE",
            "new": {"id": "v1", "user_id": "u1", "status": "transcoding", "progress": 0.5},
        }))
        .unwrap();

        match ev {
            ChangeEvent::Update { new, old } => {
                assert_eq!(new.status, VideoState::Unknown);
                assert_eq!(new.progress, Some(0.5));
                assert!(old.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_update_with_previous_row() {
        let ev = UserChannel::decode(json!({
            "eventType": "UPDATE",
            "new": {"id": "v1", "user_id": "u1", "status": "ready"},
            "old": {"id": "v1", "user_id": "u1", "status": "processing"},
        }))
        .unwrap();

        match ev {
            ChangeEvent::Update { new, old } => {
                assert_eq!(new.status, VideoState::Ready);
                assert_eq!(old.map(|o| o.status), Some(VideoState::Processing));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_delete_with_key_only() {
        let ev = UserChannel::decode(json!({"eventType": "DELETE", "old": {"id": "v9"}})).unwrap();
        assert!(ev.is_delete());
        assert_eq!(ev.row().id, "v9");
    }

    #[test]
    fn test_decode_rejects_unknown_event_type() {
        assert!(UserChannel::decode(json!({"eventType": "TRUNCATE"})).is_err());
    }
}
