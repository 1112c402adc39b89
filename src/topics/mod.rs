//! Topic kinds and their typed payloads.
//!
//! ## Contents
//! - [`TopicKind`] naming scheme, row filter and payload decoder of one topic family
//! - [`ChangeEvent`] row-level change payload (insert / update / delete)
//! - [`UserChannel`] `video_status:<userId>` → `ChangeEvent<VideoStatus>`
//! - [`TenantChannel`] `posts:<tenantId>` → `ChangeEvent<Post>`

mod change;
mod kind;
mod tenant;
mod user;

pub use change::ChangeEvent;
pub use kind::{TOPIC_SEPARATOR, TopicKind};
pub use tenant::{Post, TenantChannel};
pub use user::{UserChannel, VideoState, VideoStatus};
