//! SubscriptionRegistry: reference-counted connections per stream key.
//!
//! Consumers subscribe with an identity and a topic. The first subscriber
//! for a key opens a connection through the supervisor; later subscribers
//! share it. Each subscription carries a [`Disposer`]; the last one to
//! dispose closes the connection. Every mutation, including the identity
//! check, happens under one lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use livefeed_core::{ConnectionState, ConnectionStatus, Identity, Snapshot, StreamFailure, StreamKey, Topic};

use crate::error::FeedError;
use crate::supervisor::{ConnectionHandle, ConnectionSupervisor};

// ─── Registry ────────────────────────────────────────────────────

struct Entry {
    /// Distinguishes this connection from an earlier one under the same key.
    epoch: u64,
    ref_count: usize,
    handle: ConnectionHandle,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<StreamKey, Entry>,
    next_epoch: u64,
}

type Shared = Arc<Mutex<RegistryInner>>;

fn lock(inner: &Mutex<RegistryInner>) -> MutexGuard<'_, RegistryInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SubscriptionRegistry {
    supervisor: ConnectionSupervisor,
    identity: watch::Receiver<Option<Identity>>,
    inner: Shared,
}

impl SubscriptionRegistry {
    pub fn new(supervisor: ConnectionSupervisor, identity: watch::Receiver<Option<Identity>>) -> Self {
        Self {
            supervisor,
            identity,
            inner: Arc::new(Mutex::new(RegistryInner::default())),
        }
    }

    /// Register interest in `topic` under `identity`.
    ///
    /// Fails without opening anything unless `identity` is the active one.
    ///
    /// Must be called within a tokio runtime: a new connection spawns its task
    /// via [`ConnectionSupervisor::open`].
    pub fn subscribe(&self, identity: &Identity, topic: Topic) -> Result<Subscription, FeedError> {
        let key = StreamKey::new(identity.clone(), topic);
        let mut replaced = None;

        let subscription = {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            let current = self.identity.borrow().clone();
            match current {
                None => return Err(FeedError::NoIdentity),
                Some(current) if current != *identity => {
                    return Err(FeedError::IdentityMismatch {
                        requested: identity.to_string(),
                    });
                }
                Some(_) => {}
            }

            let (snapshots, status, epoch) = match inner.entries.get_mut(&key) {
                Some(entry) if !entry.handle.is_closed() => {
                    entry.ref_count += 1;
                    tracing::debug!(key = %key, ref_count = entry.ref_count, "registry: sharing connection");
                    (entry.handle.snapshots(), entry.handle.status(), entry.epoch)
                }
                _ => {
                    inner.next_epoch += 1;
                    let epoch = inner.next_epoch;
                    let handle = self.supervisor.open(key.clone());
                    let channels = (handle.snapshots(), handle.status(), epoch);
                    let entry = Entry {
                        epoch,
                        ref_count: 1,
                        handle,
                    };
                    if let Some(dead) = inner.entries.insert(key.clone(), entry) {
                        tracing::debug!(key = %key, "registry: replacing terminated connection");
                        replaced = Some(dead.handle);
                    }
                    channels
                }
            };

            Subscription {
                events: EventStream::new(key.clone(), snapshots, status),
                disposer: Disposer::new(Release {
                    registry: Arc::downgrade(&self.inner),
                    key,
                    epoch,
                }),
            }
        };

        drop(replaced);
        Ok(subscription)
    }

    /// Like [`subscribe`](Self::subscribe), but drives `callback` from a
    /// background task until the returned disposer is disposed.
    ///
    /// Must be called within a tokio runtime.
    pub fn subscribe_with<F>(&self, identity: &Identity, topic: Topic, callback: F) -> Result<Disposer, FeedError>
    where
        F: FnMut(FeedEvent) + Send + 'static,
    {
        let (events, mut disposer) = self.subscribe(identity, topic)?.into_parts();
        let cancel = CancellationToken::new();
        disposer.forwarder = Some(cancel.clone());
        tokio::spawn(forward(events, cancel, callback));
        Ok(disposer)
    }

    /// Close every connection not keyed by `current`, whatever its ref count.
    /// Returns how many were closed.
    pub fn retain_identity(&self, current: Option<&Identity>) -> usize {
        let stale: Vec<ConnectionHandle> = {
            let mut inner = lock(&self.inner);
            let keys: Vec<StreamKey> = inner
                .entries
                .keys()
                .filter(|key| Some(&key.identity) != current)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|key| inner.entries.remove(key))
                .map(|entry| entry.handle)
                .collect()
        };
        for handle in &stale {
            tracing::debug!(key = %handle.key(), "registry: closing connection of previous identity");
            handle.close();
        }
        stale.len()
    }

    /// Outstanding subscriptions on `key`'s connection. Zero when none is registered.
    ///
    /// An entry whose connection failed terminally stays registered until the
    /// next subscribe replaces it, so its count is the subscribers still holding
    /// on to the failed stream, not live interest. [`live_connections`](Self::live_connections)
    /// skips such entries.
    pub fn ref_count(&self, key: &StreamKey) -> usize {
        lock(&self.inner).entries.get(key).map_or(0, |entry| entry.ref_count)
    }

    /// Registered connections that have not closed.
    pub fn live_connections(&self) -> usize {
        lock(&self.inner)
            .entries
            .values()
            .filter(|entry| !entry.handle.is_closed())
            .count()
    }

    pub fn state(&self, key: &StreamKey) -> Option<ConnectionState> {
        lock(&self.inner).entries.get(key).map(|entry| entry.handle.state())
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }
}

async fn forward<F>(mut events: EventStream, cancel: CancellationToken, mut callback: F)
where
    F: FnMut(FeedEvent) + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.next_event() => match event {
                Some(event) => callback(event),
                None => break,
            },
        }
    }
}

// ─── Disposer ────────────────────────────────────────────────────

struct Release {
    registry: Weak<Mutex<RegistryInner>>,
    key: StreamKey,
    epoch: u64,
}

impl Release {
    fn run(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let handle = {
            let mut inner = lock(&registry);
            let last = match inner.entries.get_mut(&self.key) {
                Some(entry) if entry.epoch == self.epoch => {
                    entry.ref_count = entry.ref_count.saturating_sub(1);
                    entry.ref_count == 0
                }
                // Entry gone or replaced: this subscription's connection is already closed.
                _ => false,
            };
            if last {
                inner.entries.remove(&self.key).map(|entry| entry.handle)
            } else {
                None
            }
        };
        if let Some(handle) = handle {
            tracing::debug!(key = %self.key, "registry: last subscriber left");
            handle.close();
        }
    }
}

/// Releases one subscription. Idempotent; dropping it disposes it.
pub struct Disposer {
    release: Release,
    forwarder: Option<CancellationToken>,
    disposed: AtomicBool,
}

impl Disposer {
    fn new(release: Release) -> Self {
        Self {
            release,
            forwarder: None,
            disposed: AtomicBool::new(false),
        }
    }

    /// Returns `true` on the call that actually released the subscription.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(forwarder) = &self.forwarder {
            forwarder.cancel();
        }
        self.release.run();
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn key(&self) -> &StreamKey {
        &self.release.key
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer")
            .field("key", &self.release.key)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ─── Events ──────────────────────────────────────────────────────

/// What a consumer observes on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Latest merged snapshot; bursts arrive as one event.
    Snapshot(Snapshot),
    /// The connection failed terminally. Reported once.
    Unavailable(StreamFailure),
    /// The connection was closed by teardown (dispose, identity change).
    Closed,
}

/// Coalesced event stream of one subscription.
pub struct EventStream {
    key: StreamKey,
    snapshots: watch::Receiver<Snapshot>,
    status: watch::Receiver<ConnectionStatus>,
    finished: bool,
}

impl EventStream {
    fn new(key: StreamKey, snapshots: watch::Receiver<Snapshot>, status: watch::Receiver<ConnectionStatus>) -> Self {
        Self {
            key,
            snapshots,
            status,
            finished: false,
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Wait for the next event. `None` once the closing event has been returned.
    ///
    /// A released connection yields [`FeedEvent::Closed`] straight away and any
    /// unread snapshot is discarded. A terminal failure still delivers the last
    /// snapshot first.
    pub async fn next_event(&mut self) -> Option<FeedEvent> {
        if self.finished {
            return None;
        }
        loop {
            let status = self.status.borrow_and_update().clone();
            if status.is_torn_down() {
                return self.finish(status);
            }
            if self.snapshots.has_changed().unwrap_or(false) {
                let snapshot = self.snapshots.borrow_and_update().clone();
                // A frame merged while the connection was being torn down
                // belongs to a released stream.
                if self.status.borrow().is_torn_down() {
                    let status = self.status.borrow_and_update().clone();
                    return self.finish(status);
                }
                return Some(FeedEvent::Snapshot(snapshot));
            }
            if status.state.is_closed() {
                return self.finish(status);
            }
            tokio::select! {
                changed = self.snapshots.changed() => {
                    if changed.is_err() {
                        let status = self.status.borrow().clone();
                        return self.finish(status);
                    }
                }
                changed = self.status.changed() => {
                    if changed.is_err() {
                        let status = self.status.borrow().clone();
                        return self.finish(status);
                    }
                }
            }
        }
    }

    fn finish(&mut self, status: ConnectionStatus) -> Option<FeedEvent> {
        self.finished = true;
        Some(match status.failure {
            Some(failure) => FeedEvent::Unavailable(failure),
            None => FeedEvent::Closed,
        })
    }
}

// ─── Subscription ────────────────────────────────────────────────

/// A live interest in one stream: its channels plus the disposer.
pub struct Subscription {
    events: EventStream,
    disposer: Disposer,
}

impl Subscription {
    pub fn key(&self) -> &StreamKey {
        &self.events.key
    }

    /// Latest snapshot without waiting.
    pub fn snapshot(&self) -> Snapshot {
        self.events.snapshots.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.events.status.borrow().clone()
    }

    /// A fresh receiver on the snapshot channel.
    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.events.snapshots.clone()
    }

    /// A fresh receiver on the status channel.
    pub fn statuses(&self) -> watch::Receiver<ConnectionStatus> {
        self.events.status.clone()
    }

    pub async fn next_event(&mut self) -> Option<FeedEvent> {
        self.events.next_event().await
    }

    /// Wait until the connection is open or closed, and return that status.
    pub async fn wait_ready(&self) -> ConnectionStatus {
        let mut status = self.events.status.clone();
        if let Ok(ready) = status
            .wait_for(|s| s.state == ConnectionState::Open || s.state.is_closed())
            .await
        {
            return ready.clone();
        }
        status.borrow().clone()
    }

    pub fn dispose(&self) -> bool {
        self.disposer.dispose()
    }

    pub fn disposer(&self) -> &Disposer {
        &self.disposer
    }

    pub fn into_parts(self) -> (EventStream, Disposer) {
        (self.events, self.disposer)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", self.key())
            .field("state", &self.status().state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::EventDispatcher;
    use crate::transport::MemoryTransport;
    use livefeed_core::RetryPolicy;

    struct Fixture {
        transport: MemoryTransport,
        identity: watch::Sender<Option<Identity>>,
        registry: SubscriptionRegistry,
    }

    fn fixture() -> Fixture {
        let (identity, rx) = watch::channel(Some(Identity::new("tok", "acct1")));
        let dispatcher = Arc::new(EventDispatcher::new(rx.clone()));
        let transport = MemoryTransport::new();
        let policy = RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default()
        };
        let supervisor = ConnectionSupervisor::new(Arc::new(transport.clone()), dispatcher, policy);
        Fixture {
            transport,
            identity,
            registry: SubscriptionRegistry::new(supervisor, rx),
        }
    }

    fn acct1() -> Identity {
        Identity::new("tok", "acct1")
    }

    #[tokio::test(start_paused = true)]
    async fn shared_connection_closes_on_last_dispose() {
        let f = fixture();
        let a = f.registry.subscribe(&acct1(), Topic::Account).unwrap();
        let b = f.registry.subscribe(&acct1(), Topic::Account).unwrap();
        let key = a.key().clone();
        assert_eq!(f.registry.ref_count(&key), 2);
        assert_eq!(f.registry.live_connections(), 1);

        a.wait_ready().await;
        assert_eq!(f.transport.handshakes(), 1);

        assert!(a.dispose());
        assert_eq!(f.registry.ref_count(&key), 1);
        assert_eq!(f.registry.state(&key), Some(ConnectionState::Open));

        drop(b);
        assert_eq!(f.registry.ref_count(&key), 0);
        assert_eq!(f.registry.live_connections(), 0);
        assert_eq!(f.registry.state(&key), None);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_twice_is_a_no_op() {
        let f = fixture();
        let a = f.registry.subscribe(&acct1(), Topic::Account).unwrap();
        let _b = f.registry.subscribe(&acct1(), Topic::Account).unwrap();
        let key = a.key().clone();

        assert!(a.dispose());
        assert!(!a.dispose());
        assert_eq!(f.registry.ref_count(&key), 1);
        assert_eq!(f.registry.live_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_identity_opens_nothing() {
        let f = fixture();
        let err = f
            .registry
            .subscribe(&Identity::new("tok", "acct2"), Topic::Account)
            .unwrap_err();
        assert!(matches!(err, FeedError::IdentityMismatch { .. }));

        f.identity.send_replace(None);
        let err = f.registry.subscribe(&acct1(), Topic::Account).unwrap_err();
        assert_eq!(err, FeedError::NoIdentity);
        assert_eq!(f.registry.live_connections(), 0);
        assert_eq!(f.transport.handshakes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retain_identity_closes_regardless_of_ref_count() {
        let f = fixture();
        let mut a = f.registry.subscribe(&acct1(), Topic::Account).unwrap();
        let _b = f.registry.subscribe(&acct1(), Topic::Account).unwrap();
        let _q = f.registry.subscribe(&acct1(), Topic::quotes(["EURUSD"])).unwrap();

        f.identity.send_replace(Some(Identity::new("tok2", "acct2")));
        assert_eq!(f.registry.retain_identity(Some(&Identity::new("tok2", "acct2"))), 2);
        assert_eq!(f.registry.live_connections(), 0);

        assert_eq!(a.next_event().await, Some(FeedEvent::Closed));
        assert_eq!(a.next_event().await, None);
        // Late dispose of a torn-down subscription changes nothing.
        assert!(a.dispose());
        assert_eq!(f.registry.live_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_entry_is_replaced_on_next_subscribe() {
        let f = fixture();
        f.transport.reject_token("tok");
        let mut old = f.registry.subscribe(&acct1(), Topic::Account).unwrap();
        let key = old.key().clone();
        assert!(matches!(old.next_event().await, Some(FeedEvent::Unavailable(StreamFailure::AuthRejected { .. }))));
        assert_eq!(f.registry.live_connections(), 0);
        assert_eq!(f.registry.ref_count(&key), 1);

        let fresh = f.registry.subscribe(&acct1(), Topic::Account).unwrap();
        assert_eq!(f.registry.ref_count(&key), 1);

        // The dead connection's disposer must not release the fresh one.
        assert!(old.dispose());
        assert_eq!(f.registry.ref_count(&key), 1);
        assert_eq!(fresh.key(), &key);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_receives_coalesced_snapshot() {
        let f = fixture();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let disposer = f
            .registry
            .subscribe_with(&acct1(), Topic::Account, move |event| {
                let _ = tx.send(event);
            })
            .unwrap();
        let key = disposer.key().clone();

        while f.registry.state(&key) != Some(ConnectionState::Open) {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        let sub = f.registry.subscribe(&acct1(), Topic::Account).unwrap();
        let mut snapshots = sub.snapshots();
        for m in [10, 20, 30] {
            f.transport.push(&key, format!(r#"{{"type":"account","payload":{{"margin":{m}}}}}"#));
        }
        snapshots.wait_for(|s| s.as_account().and_then(|a| a.margin) == Some(30.0)).await.unwrap();

        match rx.recv().await {
            Some(FeedEvent::Snapshot(snapshot)) => assert_eq!(snapshot.as_account().unwrap().margin, Some(30.0)),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        assert!(disposer.dispose());
        drop(sub);
        assert_eq!(f.registry.live_connections(), 0);
    }

    #[test]
    #[should_panic(expected = "Tokio 1.x runtime")]
    fn subscribe_needs_a_runtime() {
        let f = fixture();
        let _ = f.registry.subscribe(&acct1(), Topic::Account);
    }

    fn stream_parts() -> (
        watch::Sender<Snapshot>,
        watch::Sender<ConnectionStatus>,
        EventStream,
    ) {
        let (snap_tx, snap_rx) = watch::channel(Snapshot::empty(&Topic::Account));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let stream = EventStream::new(StreamKey::new(acct1(), Topic::Account), snap_rx, status_rx);
        (snap_tx, status_tx, stream)
    }

    fn margin_frame(margin: f64) -> Snapshot {
        let mut snapshot = Snapshot::empty(&Topic::Account);
        if let Snapshot::Account(account) = &mut snapshot {
            account.margin = Some(margin);
        }
        snapshot
    }

    #[tokio::test]
    async fn teardown_wins_over_a_late_snapshot() {
        let (snap_tx, status_tx, mut stream) = stream_parts();
        status_tx.send_modify(|s| {
            s.transition(ConnectionState::Closed);
        });
        snap_tx.send_replace(margin_frame(10.0));

        assert_eq!(stream.next_event().await, Some(FeedEvent::Closed));
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test]
    async fn terminal_failure_keeps_the_pending_snapshot() {
        let (snap_tx, status_tx, mut stream) = stream_parts();
        snap_tx.send_replace(margin_frame(10.0));
        let failure = StreamFailure::RetryExhausted { attempts: 2 };
        status_tx.send_modify(|s| {
            s.transition(ConnectionState::Connecting);
            s.fail(failure.clone());
        });

        assert_eq!(stream.next_event().await, Some(FeedEvent::Snapshot(margin_frame(10.0))));
        assert_eq!(stream.next_event().await, Some(FeedEvent::Unavailable(failure)));
        assert_eq!(stream.next_event().await, None);
    }
}
