//! LiveFeed: the wired-up telemetry layer.
//!
//! Owns the identity channel and connects the gate, registry, supervisor and
//! dispatcher to one transport.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use livefeed_core::{Identity, RetryPolicy, Snapshot, Topic};

use crate::auth_gate::{AuthGate, IdentityChange};
use crate::config::FeedConfig;
use crate::dispatcher::EventDispatcher;
use crate::error::FeedError;
use crate::registry::{Disposer, FeedEvent, Subscription, SubscriptionRegistry};
use crate::supervisor::ConnectionSupervisor;
use crate::transport::{Transport, WsTransport};

pub struct LiveFeed {
    gate: AuthGate,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<EventDispatcher>,
}

impl LiveFeed {
    /// Start logged out.
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        let (tx, rx) = watch::channel(None);
        let dispatcher = Arc::new(EventDispatcher::new(rx.clone()));
        let supervisor = ConnectionSupervisor::new(transport, Arc::clone(&dispatcher), policy);
        let registry = Arc::new(SubscriptionRegistry::new(supervisor, rx));
        let gate = AuthGate::new(tx, Arc::clone(&registry));
        Self {
            gate,
            registry,
            dispatcher,
        }
    }

    /// A feed over the configured WebSocket endpoint.
    pub fn connect(config: &FeedConfig) -> Self {
        Self::new(Arc::new(WsTransport::from_config(config)), config.retry.clone())
    }

    pub fn set_identity(&self, identity: Option<Identity>) -> IdentityChange {
        self.gate.set_identity(identity)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.gate.current()
    }

    /// Subscribe under the active identity. Requires a tokio runtime.
    pub fn subscribe(&self, topic: Topic) -> Result<Subscription, FeedError> {
        let identity = self.gate.current().ok_or(FeedError::NoIdentity)?;
        self.registry.subscribe(&identity, topic)
    }

    /// Subscribe under an explicit identity, which must be the active one.
    pub fn subscribe_as(&self, identity: &Identity, topic: Topic) -> Result<Subscription, FeedError> {
        self.registry.subscribe(identity, topic)
    }

    pub fn subscribe_with<F>(&self, topic: Topic, callback: F) -> Result<Disposer, FeedError>
    where
        F: FnMut(FeedEvent) + Send + 'static,
    {
        let identity = self.gate.current().ok_or(FeedError::NoIdentity)?;
        self.registry.subscribe_with(&identity, topic, callback)
    }

    pub fn current_snapshot(&self, topic: &Topic) -> Snapshot {
        self.dispatcher.current_snapshot(topic)
    }

    /// Keep `topic` subscribed across identity changes.
    ///
    /// Each new identity gets a fresh subscription; events from every
    /// subscription in turn reach `callback`. Logged-out periods are quiet.
    pub fn follow<F>(&self, topic: Topic, callback: F) -> Follower
    where
        F: FnMut(FeedEvent) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        tokio::spawn(follow_loop(
            Arc::clone(&self.registry),
            self.gate.watch(),
            topic,
            cancel.clone(),
            callback,
        ));
        Follower { cancel }
    }

    pub fn gate(&self) -> &AuthGate {
        &self.gate
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }
}

// ─── Follower ────────────────────────────────────────────────────

/// Stops following when dropped.
#[derive(Debug)]
pub struct Follower {
    cancel: CancellationToken,
}

impl Follower {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Follower {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn follow_loop<F>(
    registry: Arc<SubscriptionRegistry>,
    mut identity: watch::Receiver<Option<Identity>>,
    topic: Topic,
    cancel: CancellationToken,
    mut callback: F,
) where
    F: FnMut(FeedEvent) + Send + 'static,
{
    loop {
        let current = identity.borrow_and_update().clone();
        let mut active = current.and_then(|id| match registry.subscribe(&id, topic.clone()) {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                tracing::debug!(topic = %topic, error = %e, "follow: subscribe skipped");
                None
            }
        });

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                changed = identity.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                event = next_event(&mut active) => match event {
                    Some(event) => callback(event),
                    None => active = None,
                },
            }
        }
    }
}

async fn next_event(active: &mut Option<Subscription>) -> Option<FeedEvent> {
    match active {
        Some(subscription) => subscription.next_event().await,
        None => std::future::pending().await,
    }
}
