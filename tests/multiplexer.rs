use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Instant;

use chanvisor::{
    BackoffPolicy, ChannelFilter, ChannelHandle, ChannelState, Config, Event, EventKind,
    JitterPolicy, MemoryTransport, Multiplexer, SessionEvent, SignalSink, Subscribe,
    SubscribeError, TenantChannel, Transport, TransportError, UserChannel, VideoState,
};

fn mux_with(transport: &Arc<MemoryTransport>, cfg: Config) -> Arc<Multiplexer> {
    Multiplexer::builder(transport.clone()).with_config(cfg).build()
}

fn mux(transport: &Arc<MemoryTransport>) -> Arc<Multiplexer> {
    mux_with(transport, Config::default())
}

async fn next_of(rx: &mut broadcast::Receiver<Event>, kind: EventKind) -> Event {
    loop {
        match rx.recv().await {
            Ok(ev) if ev.kind == kind => return ev,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("bus closed"),
        }
    }
}

async fn settle_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn video_update(user: &str, video: &str, status: &str) -> serde_json::Value {
    json!({
        "eventType": "UPDATE",
        "new": {"id": video, "user_id": user, "status": status},
    })
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_subscribes_issue_one_join() {
    let transport = Arc::new(MemoryTransport::new());
    let mux = mux(&transport);
    transport.hold_joins();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let mux = Arc::clone(&mux);
        tasks.push(tokio::spawn(async move {
            mux.subscribe_to_tenant_channel("t1", |_| {}).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        mux.channel_state::<TenantChannel>("t1").await,
        Some(ChannelState::Pending)
    );
    transport.release_joins();

    let mut subs = Vec::new();
    for t in tasks {
        subs.push(t.await.unwrap().unwrap());
    }

    assert_eq!(transport.joins_for("posts:t1"), 1);
    assert_eq!(transport.opens(), 1);
    let handle = subs[0].channel();
    assert!(handle.is_some());
    assert!(subs.iter().all(|s| s.channel() == handle));
    assert_eq!(mux.ref_count::<TenantChannel>("t1").await, 8);
}

#[tokio::test(start_paused = true)]
async fn test_channel_closes_exactly_once_on_last_release() {
    let transport = Arc::new(MemoryTransport::new());
    let mux = mux(&transport);

    let mut subs = Vec::new();
    for _ in 0..4 {
        subs.push(mux.subscribe_to_tenant_channel("t1", |_| {}).await.unwrap());
    }

    for sub in subs.iter_mut().take(3) {
        sub.unsubscribe().await;
        assert_eq!(transport.closes_for("posts:t1"), 0);
    }
    assert_eq!(mux.ref_count::<TenantChannel>("t1").await, 1);
    assert_eq!(
        mux.channel_state::<TenantChannel>("t1").await,
        Some(ChannelState::Joined)
    );

    subs[3].unsubscribe().await;
    subs[3].unsubscribe().await;
    subs[0].unsubscribe().await;
    assert_eq!(transport.closes_for("posts:t1"), 1);
    assert_eq!(transport.open_channels("posts:t1"), 0);
    assert_eq!(mux.channel_state::<TenantChannel>("t1").await, None);
    assert!(mux.topics::<TenantChannel>().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rapid_resubscribe_is_throttled() {
    let transport = Arc::new(MemoryTransport::new());
    let mux = mux(&transport);
    let mut events = mux.events();
    let t0 = Instant::now();

    let mut a = mux.subscribe_to_tenant_channel("t1", |_| {}).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut b = mux.subscribe_to_tenant_channel("t1", |_| {}).await.unwrap();
    assert_eq!(transport.joins_for("posts:t1"), 1);

    a.unsubscribe().await;
    b.unsubscribe().await;

    let _c = mux.subscribe_to_tenant_channel("t1", |_| {}).await.unwrap();
    let throttled = next_of(&mut events, EventKind::JoinThrottled).await;
    assert_eq!(throttled.delay_ms, Some(800));
    assert!(t0.elapsed() >= Duration::from_secs(1));
    assert_eq!(transport.joins_for("posts:t1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_monotone_capped_and_resets() {
    let transport = Arc::new(MemoryTransport::new());
    let cfg = Config {
        backoff: BackoffPolicy {
            first: Duration::from_secs(1),
            max: Duration::from_secs(4),
            factor: 2.0,
            jitter: JitterPolicy::None,
        },
        ..Config::default()
    };
    let mux = mux_with(&transport, cfg);
    let mut events = mux.events();

    for _ in 0..5 {
        transport.fail_next_join("video_status:u1", TransportError::connection("refused"));
    }
    let sub = mux.subscribe_to_user_channel("u1", |_| {}).await.unwrap();
    assert_eq!(sub.channel(), None);

    let mut delays = Vec::new();
    for _ in 0..5 {
        delays.push(next_of(&mut events, EventKind::BackoffScheduled).await.delay_ms.unwrap());
    }
    assert_eq!(delays, vec![1000, 2000, 4000, 4000, 4000]);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));

    next_of(&mut events, EventKind::ChannelJoined).await;
    assert_eq!(
        mux.channel_state::<UserChannel>("u1").await,
        Some(ChannelState::Joined)
    );

    transport.fail_channel("video_status:u1", TransportError::connection("reset"));
    let after_success = next_of(&mut events, EventKind::BackoffScheduled).await;
    assert_eq!(after_success.delay_ms, Some(1000));
    next_of(&mut events, EventKind::ChannelJoined).await;
    assert_eq!(mux.ref_count::<UserChannel>("u1").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_token_rotation_rejoins_with_original_handlers() {
    let transport = Arc::new(MemoryTransport::new());
    let mux = mux(&transport);
    let mut events = mux.events();

    let user_seen = Arc::new(Mutex::new(Vec::new()));
    let tenant_seen = Arc::new(Mutex::new(0usize));

    let sink = Arc::clone(&user_seen);
    let _u = mux
        .subscribe_to_user_channel("u1", move |ev| sink.lock().push(ev.row().status))
        .await
        .unwrap();
    let count = Arc::clone(&tenant_seen);
    let _t = mux
        .subscribe_to_tenant_channel("t1", move |_| *count.lock() += 1)
        .await
        .unwrap();

    let (session_tx, session_rx) = broadcast::channel(8);
    let _listener = mux.attach_session(session_rx);

    session_tx.send(SessionEvent::TokenRefreshed).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    session_tx.send(SessionEvent::TokenRefreshed).unwrap();

    next_of(&mut events, EventKind::RotationCollapsed).await;
    let finished = next_of(&mut events, EventKind::RotationFinished).await;
    assert_eq!(finished.refs, Some(2));

    settle_until(|| {
        transport.joins_for("video_status:u1") == 2 && transport.joins_for("posts:t1") == 2
    })
    .await;

    // Well past every backoff and throttle window: no late rejoin may show up.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.joins_for("video_status:u1"), 2);
    assert_eq!(transport.joins_for("posts:t1"), 2);
    assert_eq!(transport.open_channels("video_status:u1"), 1);
    assert_eq!(transport.open_channels("posts:t1"), 1);
    assert_eq!(transport.closes_for("video_status:u1"), 1);
    assert_eq!(transport.closes_for("posts:t1"), 1);
    assert_eq!(mux.ref_count::<UserChannel>("u1").await, 1);

    transport.emit("video_status:u1", video_update("u1", "v1", "ready"));
    transport.emit(
        "posts:t1",
        json!({"eventType": "INSERT", "new": {"id": "p1", "tenant_id": "t1"}}),
    );
    settle_until(|| !user_seen.lock().is_empty() && *tenant_seen.lock() == 1).await;
    assert_eq!(*user_seen.lock(), vec![VideoState::Ready]);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_mid_rotation_joins_the_rebuilt_entry() {
    let transport = Arc::new(MemoryTransport::new());
    let mux = mux(&transport);
    let calls = Arc::new(Mutex::new(Vec::new()));

    let c1 = Arc::clone(&calls);
    let _first = mux
        .subscribe_to_user_channel("u1", move |_| c1.lock().push("h1"))
        .await
        .unwrap();

    let rotation = tokio::spawn({
        let mux = Arc::clone(&mux);
        async move { mux.on_token_refreshed().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let c2 = Arc::clone(&calls);
    let late = tokio::spawn({
        let mux = Arc::clone(&mux);
        async move {
            mux.subscribe_to_user_channel("u1", move |_| c2.lock().push("h2"))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!late.is_finished());
    assert_eq!(mux.ref_count::<UserChannel>("u1").await, 0);

    assert!(rotation.await.unwrap());
    let second = late.await.unwrap().unwrap();
    assert!(second.channel().is_some());

    assert_eq!(transport.opens(), 2);
    assert_eq!(transport.joins_for("video_status:u1"), 2);
    assert_eq!(transport.open_channels("video_status:u1"), 1);
    assert_eq!(mux.ref_count::<UserChannel>("u1").await, 2);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.joins_for("video_status:u1"), 2);

    transport.emit("video_status:u1", video_update("u1", "v1", "ready"));
    settle_until(|| !calls.lock().is_empty()).await;
    assert_eq!(*calls.lock(), vec!["h2"]);
}

#[tokio::test(start_paused = true)]
async fn test_rotation_carries_over_a_pending_subscribe() {
    let transport = Arc::new(MemoryTransport::new());
    let mux = mux(&transport);
    transport.hold_joins();

    let pending = tokio::spawn({
        let mux = Arc::clone(&mux);
        async move { mux.subscribe_to_tenant_channel("t1", |_| {}).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(mux.on_token_refreshed().await);
    let sub = pending.await.unwrap().unwrap();
    assert!(sub.is_active());
    assert_eq!(sub.channel(), None);

    transport.release_joins();
    let probe = Arc::clone(&mux);
    for _ in 0..100 {
        if probe.channel_state::<TenantChannel>("t1").await == Some(ChannelState::Joined) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        mux.channel_state::<TenantChannel>("t1").await,
        Some(ChannelState::Joined)
    );
    assert_eq!(mux.ref_count::<TenantChannel>("t1").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_forces_a_fresh_join() {
    let transport = Arc::new(MemoryTransport::new());
    let mux = mux(&transport);

    let mut stale = mux.subscribe_to_tenant_channel("t1", |_| {}).await.unwrap();
    mux.on_session_event(SessionEvent::SignedOut).await;

    assert_eq!(mux.channel_state::<TenantChannel>("t1").await, None);
    assert_eq!(transport.closes_for("posts:t1"), 1);

    let before = Instant::now();
    let fresh = mux.subscribe_to_tenant_channel("t1", |_| {}).await.unwrap();
    assert!(before.elapsed() < Duration::from_secs(1));
    assert_eq!(transport.opens(), 2);
    assert_eq!(transport.joins_for("posts:t1"), 2);
    assert_ne!(fresh.channel(), stale.channel());

    stale.unsubscribe().await;
    assert_eq!(mux.ref_count::<TenantChannel>("t1").await, 1);
    assert_eq!(transport.open_channels("posts:t1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_fails_pending_subscribers() {
    let transport = Arc::new(MemoryTransport::new());
    let mux = mux(&transport);
    transport.hold_joins();

    let pending = tokio::spawn({
        let mux = Arc::clone(&mux);
        async move { mux.subscribe_to_user_channel("u1", |_| {}).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    mux.on_signed_out().await;
    assert_eq!(pending.await.unwrap().unwrap_err(), SubscribeError::SignedOut);
    assert_eq!(mux.ref_count::<UserChannel>("u1").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_handler_replaces_first() {
    let transport = Arc::new(MemoryTransport::new());
    let mux = mux(&transport);
    let calls = Arc::new(Mutex::new(Vec::new()));

    let c1 = Arc::clone(&calls);
    let mut first = mux
        .subscribe_to_user_channel("u1", move |_| c1.lock().push("h1"))
        .await
        .unwrap();
    let c2 = Arc::clone(&calls);
    let mut second = mux
        .subscribe_to_user_channel("u1", move |_| c2.lock().push("h2"))
        .await
        .unwrap();

    first.unsubscribe().await;
    assert_eq!(transport.opens(), 1);
    assert_eq!(mux.ref_count::<UserChannel>("u1").await, 1);
    assert_eq!(transport.open_channels("video_status:u1"), 1);
    assert_eq!(transport.closes(), 0);

    transport.emit("video_status:u1", video_update("u1", "v1", "processing"));
    settle_until(|| !calls.lock().is_empty()).await;
    assert_eq!(*calls.lock(), vec!["h2"]);

    second.unsubscribe().await;
    assert_eq!(transport.closes_for("video_status:u1"), 1);
    assert_eq!(transport.open_channels("video_status:u1"), 0);
    assert_eq!(mux.channel_state::<UserChannel>("u1").await, None);
}

struct SlowClose {
    inner: Arc<MemoryTransport>,
    delay: Duration,
}

#[async_trait]
impl Transport for SlowClose {
    async fn open(
        &self,
        topic: &str,
        filter: &ChannelFilter,
        sink: SignalSink,
    ) -> Result<ChannelHandle, TransportError> {
        self.inner.open(topic, filter, sink).await
    }

    async fn join(&self, channel: ChannelHandle) -> Result<(), TransportError> {
        self.inner.join(channel).await
    }

    async fn close(&self, channel: ChannelHandle) -> Result<(), TransportError> {
        tokio::time::sleep(self.delay).await;
        self.inner.close(channel).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_during_teardown_waits_for_close() {
    let memory = Arc::new(MemoryTransport::new());
    let transport = Arc::new(SlowClose {
        inner: Arc::clone(&memory),
        delay: Duration::from_millis(300),
    });
    let mux = Multiplexer::builder(transport).build();

    let mut sub = mux.subscribe_to_tenant_channel("t1", |_| {}).await.unwrap();
    let first = sub.channel();
    let started = Instant::now();
    let closing = tokio::spawn(async move { sub.unsubscribe().await });

    for _ in 0..50 {
        if mux.channel_state::<TenantChannel>("t1").await == Some(ChannelState::Closed) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(
        mux.channel_state::<TenantChannel>("t1").await,
        Some(ChannelState::Closed)
    );

    let again = mux.subscribe_to_tenant_channel("t1", |_| {}).await.unwrap();
    closing.await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(memory.opens(), 2);
    assert_eq!(memory.closes_for("posts:t1"), 1);
    assert_ne!(again.channel(), first);
    assert_eq!(mux.ref_count::<TenantChannel>("t1").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_failure_surfaces_to_caller() {
    let transport = Arc::new(MemoryTransport::new());
    let mux = mux(&transport);
    transport.fail_next_join("posts:t1", TransportError::rejected("row level security"));

    let err = mux
        .subscribe_to_tenant_channel("t1", |_| {})
        .await
        .unwrap_err();
    assert_eq!(err.as_label(), "subscribe_rejected");
    assert_eq!(err.topic(), Some("posts:t1"));
    assert_eq!(mux.channel_state::<TenantChannel>("t1").await, None);
    assert_eq!(transport.joins_for("posts:t1"), 1);

    let err = mux.subscribe_to_user_channel("", |_| {}).await.unwrap_err();
    assert!(matches!(err, SubscribeError::InvalidTopic { .. }));
    assert_eq!(transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_join_timeout_is_retried() {
    let transport = Arc::new(MemoryTransport::new());
    let cfg = Config {
        join_timeout: Duration::from_secs(2),
        ..Config::default()
    };
    let mux = mux_with(&transport, cfg);
    let mut events = mux.events();
    transport.hold_joins();

    let sub = mux.subscribe_to_tenant_channel("t1", |_| {}).await.unwrap();
    assert_eq!(sub.channel(), None);
    let failed = next_of(&mut events, EventKind::ChannelFailed).await;
    assert!(failed.reason.unwrap().starts_with("transport_timeout"));

    transport.release_joins();
    next_of(&mut events, EventKind::ChannelJoined).await;
    assert_eq!(
        mux.channel_state::<TenantChannel>("t1").await,
        Some(ChannelState::Joined)
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_everything_and_refuses_new_work() {
    let transport = Arc::new(MemoryTransport::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    struct Recorder(Arc<Mutex<Vec<EventKind>>>);

    #[async_trait]
    impl Subscribe for Recorder {
        async fn on_event(&self, ev: &Event) {
            self.0.lock().push(ev.kind);
        }
        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    let mux = Multiplexer::builder(transport.clone())
        .with_subscribers(vec![Arc::new(Recorder(Arc::clone(&seen)))])
        .build();

    let _u = mux.subscribe_to_user_channel("u1", |_| {}).await.unwrap();
    let _t = mux.subscribe_to_tenant_channel("t1", |_| {}).await.unwrap();

    mux.shutdown().await;
    mux.shutdown().await;
    assert_eq!(transport.closes(), 2);
    assert_eq!(
        mux.subscribe_to_tenant_channel("t2", |_| {}).await.unwrap_err(),
        SubscribeError::ShutDown
    );

    let seen = seen.lock();
    assert!(seen.contains(&EventKind::ChannelJoined));
    assert!(seen.contains(&EventKind::ChannelClosed));
}
