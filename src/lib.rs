//! # chanvisor
//!
//! **Chanvisor** multiplexes many logical realtime subscribers over a small number of
//! physical channels of a database change feed.
//!
//! It reference-counts channels per topic, coalesces concurrent joins, throttles rapid
//! rejoin churn, retries transient transport failures with capped exponential backoff, and
//! rebuilds every channel when the session token rotates, keeping each subscriber's handler.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   subscribe_to_user_channel(u1, h)     subscribe_to_tenant_channel(t1, h)
//!               │                                    │
//!               ▼                                    ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Multiplexer                                                      │
//! │  - Registry<UserChannel>    video_status:<userId> → ChannelEntry  │
//! │  - Registry<TenantChannel>  posts:<tenantId>      → ChannelEntry  │
//! │  - JoinThrottle (shared)    - RotationCoordinator (gate, flag)    │
//! │  - Bus (broadcast events)   - SubscriberSet (observer fan-out)    │
//! └──────┬──────────────────────────────────────────────┬─────────────┘
//!        │ open / join / close                          │ SessionEvent
//!        ▼                                              │ (TokenRefreshed,
//! ┌──────────────────┐       ┌─────────────────────┐    │  SignedOut)
//! │ TransportAdapter │──────►│ dyn Transport       │    │
//! │ timeout, dedupe, │       │ (socket client or   │◄───┘
//! │ decode, close    │       │  MemoryTransport)   │
//! └──────────────────┘       └─────────┬───────────┘
//!        ▲                             │ SignalSink: message / error / closed
//!        └──── pump task per channel ◄─┘
//! ```
//!
//! ### Lifecycle of one topic
//! ```text
//! subscribe ──► Idle ──► Pending ──(join ok)──► Joined ──(refs → 0)──► closed, removed
//!                          │  ▲                   │
//!               retryable  │  │ after backoff     │ channel error
//!                          ▼  │                   ▼
//!                         Error ◄─────────────────┘
//!                          │
//!               non-retryable ──► error returned to the subscriber, no retry
//! ```
//!
//! ## Features
//! | Area              | Description                                                   | Key types / traits                          |
//! |-------------------|---------------------------------------------------------------|---------------------------------------------|
//! | **Facade**        | Subscribe per user / per tenant, get a disposer back.         | [`Multiplexer`], [`Subscription`]           |
//! | **Topic kinds**   | Topic naming, server-side filter, typed payload decoding.     | [`TopicKind`], [`UserChannel`], [`TenantChannel`] |
//! | **Transport**     | Capability trait for the realtime client, loopback impl.      | [`Transport`], [`MemoryTransport`]          |
//! | **Policies**      | Retry backoff and rejoin throttling.                          | [`BackoffPolicy`], [`JoinThrottle`]         |
//! | **Observers**     | Hook into lifecycle events (logging, metrics).                | [`Subscribe`], [`LogWriter`]                |
//! | **Errors**        | Typed transport and subscribe errors.                         | [`TransportError`], [`SubscribeError`]      |
//! | **Configuration** | Centralize runtime settings.                                  | [`Config`]                                  |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use chanvisor::{Config, LogWriter, MemoryTransport, Multiplexer, SessionEvent, Subscribe};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(MemoryTransport::new());
//!     let observers: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
//!
//!     let mux = Multiplexer::builder(transport.clone())
//!         .with_config(Config::default())
//!         .with_subscribers(observers)
//!         .build();
//!
//!     let (session_tx, session_rx) = tokio::sync::broadcast::channel(8);
//!     mux.attach_session(session_rx);
//!
//!     let mut posts = mux
//!         .subscribe_to_tenant_channel("t1", |ev| println!("post {}", ev.row().id))
//!         .await?;
//!
//!     let _ = session_tx.send(SessionEvent::SignedOut);
//!     posts.unsubscribe().await;
//!     mux.shutdown().await;
//!     Ok(())
//! }
//! ```
mod core;
mod error;
mod events;
mod policies;
mod session;
mod subscribers;
mod topics;
mod transport;

// ---- Public re-exports ----

pub use self::core::{ChannelState, Config, Multiplexer, MultiplexerBuilder, Subscription};
pub use error::{SubscribeError, TransportError};
pub use events::{Bus, Event, EventKind};
pub use policies::{BackoffPolicy, JitterPolicy, JoinThrottle};
pub use session::SessionEvent;
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
pub use topics::{
    ChangeEvent, Post, TOPIC_SEPARATOR, TenantChannel, TopicKind, UserChannel, VideoState,
    VideoStatus,
};
pub use transport::{ChannelFilter, ChannelHandle, MemoryTransport, Signal, SignalSink, Transport};
