//! End-to-end scenarios over the in-memory transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use livefeed_core::{ConnectionState, Identity, RetryPolicy, StreamFailure, StreamKey, Topic};
use livefeed_runtime::{DispatchOutcome, DropReason, FeedEvent, IdentityChange, LiveFeed, MemoryTransport};

fn feed_with(policy: RetryPolicy) -> (MemoryTransport, LiveFeed) {
    let transport = MemoryTransport::new();
    let feed = LiveFeed::new(Arc::new(transport.clone()), policy);
    (transport, feed)
}

async fn until_state(feed: &LiveFeed, key: &StreamKey, state: ConnectionState) {
    while feed.registry().state(key) != Some(state) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn account_frame(field: &str, value: f64) -> String {
    format!(r#"{{"type":"account","payload":{{"{field}":{value}}}}}"#)
}

#[tokio::test(start_paused = true)]
async fn identity_switch_isolates_old_account() {
    let (transport, feed) = feed_with(RetryPolicy::default());
    let a = Identity::new("tokenA", "acct1");
    let b = Identity::new("tokenB", "acct2");
    let key_a = StreamKey::new(a.clone(), Topic::Account);
    let key_b = StreamKey::new(b.clone(), Topic::Account);

    feed.set_identity(Some(a.clone()));
    let mut sub_a = feed.subscribe(Topic::Account).unwrap();
    until_state(&feed, &key_a, ConnectionState::Open).await;
    transport.push(&key_a, account_frame("margin", 10.0));
    assert!(matches!(sub_a.next_event().await, Some(FeedEvent::Snapshot(_))));

    assert_eq!(feed.set_identity(Some(b.clone())), IdentityChange::Switched);

    // The acct1 connection is gone and reported closed without an error.
    assert_eq!(feed.registry().state(&key_a), None);
    assert_eq!(sub_a.next_event().await, Some(FeedEvent::Closed));
    assert_eq!(sub_a.next_event().await, None);
    let frozen = sub_a.snapshot();

    // Nothing written for acct1 after the switch lands anywhere.
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(transport.push(&key_a, account_frame("margin", 99.0)), 0);
    assert_eq!(
        feed.dispatcher().on_frame(&key_a, &account_frame("margin", 99.0)),
        DispatchOutcome::Dropped(DropReason::Detached)
    );
    assert_eq!(sub_a.snapshot(), frozen);

    // Subscribing with the stale identity is refused.
    assert!(feed.subscribe_as(&a, Topic::Account).is_err());

    let mut sub_b = feed.subscribe(Topic::Account).unwrap();
    until_state(&feed, &key_b, ConnectionState::Open).await;
    transport.push(&key_b, account_frame("margin", 20.0));
    match sub_b.next_event().await {
        Some(FeedEvent::Snapshot(snapshot)) => assert_eq!(snapshot.as_account().unwrap().margin, Some(20.0)),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(feed.registry().live_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn unread_snapshot_is_discarded_on_identity_switch() {
    let (transport, feed) = feed_with(RetryPolicy::default());
    let a = Identity::new("tokenA", "acct1");
    let key_a = StreamKey::new(a.clone(), Topic::Account);
    feed.set_identity(Some(a));
    let mut sub = feed.subscribe(Topic::Account).unwrap();
    until_state(&feed, &key_a, ConnectionState::Open).await;

    // Merged but never read before the switch.
    assert_eq!(transport.push(&key_a, account_frame("margin", 10.0)), 1);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(sub.snapshots().has_changed().unwrap_or(false));

    feed.set_identity(Some(Identity::new("tokenB", "acct2")));
    assert_eq!(sub.next_event().await, Some(FeedEvent::Closed));
    assert_eq!(sub.next_event().await, None);
}

#[tokio::test(start_paused = true)]
async fn burst_before_delivery_yields_one_callback() {
    let (transport, feed) = feed_with(RetryPolicy::default());
    feed.set_identity(Some(Identity::new("tok", "acct1")));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let disposer = feed
        .subscribe_with(Topic::Account, move |event| {
            if let FeedEvent::Snapshot(snapshot) = event {
                sink.lock().unwrap().push(snapshot.as_account().and_then(|a| a.margin));
            }
        })
        .unwrap();
    let key = disposer.key().clone();
    until_state(&feed, &key, ConnectionState::Open).await;

    for margin in [10.0, 20.0, 30.0] {
        transport.push(&key, account_frame("margin", margin));
    }
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(*seen.lock().unwrap(), vec![Some(30.0)]);
    assert!(disposer.dispose());
    assert!(!disposer.dispose());
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_never_reach_consumers() {
    let (transport, feed) = feed_with(RetryPolicy::default());
    feed.set_identity(Some(Identity::new("tok", "acct1")));
    let sub = feed.subscribe(Topic::Account).unwrap();
    until_state(&feed, sub.key(), ConnectionState::Open).await;

    transport.push(sub.key(), account_frame("equity", 500.0));
    let mut snapshots = sub.snapshots();
    snapshots.changed().await.unwrap();
    snapshots.borrow_and_update();

    transport.push(sub.key(), r#"{"type":"unknown_xyz"}"#);
    transport.push(sub.key(), "{not json");
    transport.push(sub.key(), r#"{"type":"heartbeat"}"#);
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert!(!snapshots.has_changed().unwrap());
    assert_eq!(sub.snapshot().as_account().unwrap().equity, Some(500.0));
    assert_eq!(feed.dispatcher().dropped_frames(), 2);
}

#[tokio::test(start_paused = true)]
async fn last_snapshot_survives_transient_disconnect() {
    let (transport, feed) = feed_with(RetryPolicy::default());
    feed.set_identity(Some(Identity::new("tok", "acct1")));
    let sub = feed.subscribe(Topic::quotes(["EURUSD"])).unwrap();
    let key = sub.key().clone();
    until_state(&feed, &key, ConnectionState::Open).await;

    transport.push(&key, r#"{"type":"quote","payload":{"symbol":"EURUSD","bid":1.08,"ask":1.09}}"#);
    tokio::time::sleep(Duration::from_millis(5)).await;

    transport.fail_stream(&key, livefeed_runtime::TransportError::Network("reset".into()));
    until_state(&feed, &key, ConnectionState::Errored).await;
    let during = sub.snapshot();
    assert_eq!(during.as_quotes().unwrap().get("EURUSD").unwrap().bid, Some(1.08));

    until_state(&feed, &key, ConnectionState::Open).await;
    assert_eq!(sub.status().failures, 0);
}

#[tokio::test(start_paused = true)]
async fn retry_exhaustion_is_reported_once() {
    let policy = RetryPolicy {
        max_retries: 2,
        ..RetryPolicy::default()
    };
    let (transport, feed) = feed_with(policy);
    feed.set_identity(Some(Identity::new("tok", "acct1")));
    transport.fail_next_handshakes(u32::MAX);

    let mut sub = feed.subscribe(Topic::Account).unwrap();
    assert_eq!(
        sub.next_event().await,
        Some(FeedEvent::Unavailable(StreamFailure::RetryExhausted { attempts: 3 }))
    );
    assert_eq!(sub.next_event().await, None);
    assert_eq!(transport.handshakes(), 3);
    assert!(sub.status().is_unavailable());

    // The next subscriber gets a fresh connection.
    transport.fail_next_handshakes(0);
    let fresh = feed.subscribe(Topic::Account).unwrap();
    let status = fresh.wait_ready().await;
    assert_eq!(status.state, ConnectionState::Open);
    assert_eq!(transport.handshakes(), 4);
}

#[tokio::test(start_paused = true)]
async fn rejected_identity_is_not_retried() {
    let (transport, feed) = feed_with(RetryPolicy::default());
    feed.set_identity(Some(Identity::new("revoked", "acct1")));
    transport.reject_token("revoked");

    let mut sub = feed.subscribe(Topic::Account).unwrap();
    assert!(matches!(
        sub.next_event().await,
        Some(FeedEvent::Unavailable(StreamFailure::AuthRejected { .. }))
    ));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.handshakes(), 1);
}

#[tokio::test(start_paused = true)]
async fn logout_tears_down_everything() {
    let (transport, feed) = feed_with(RetryPolicy::default());
    feed.set_identity(Some(Identity::new("tok", "acct1")));
    let _account = feed.subscribe(Topic::Account).unwrap();
    let _quotes = feed.subscribe(Topic::quotes(["EURUSD", "USDJPY"])).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(transport.total_open_channels(), 2);

    assert_eq!(feed.set_identity(None), IdentityChange::LoggedOut);
    assert_eq!(feed.registry().live_connections(), 0);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(transport.total_open_channels(), 0);
    assert!(feed.subscribe(Topic::Account).is_err());
}
