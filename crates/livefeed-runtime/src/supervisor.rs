//! ConnectionSupervisor: one background task per live connection.
//!
//! The task drives the lifecycle `Idle → Connecting → Open`, falls back to
//! `Errored` on transient failures and retries with capped, jittered
//! backoff. Authorization failures and an exhausted retry budget close the
//! connection with a terminal [`StreamFailure`]. Status is published on a
//! `watch` channel shared by the task and its [`ConnectionHandle`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use livefeed_core::{
    ConnectionState, ConnectionStatus, RetryDecision, RetryPolicy, RetryTracker, Snapshot, StreamFailure,
    StreamKey, jittered,
};

use crate::dispatcher::{EventDispatcher, SnapshotSlot};
use crate::error::TransportError;
use crate::transport::{FeedChannel, Transport};

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    policy: RetryPolicy,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn Transport>, dispatcher: Arc<EventDispatcher>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            dispatcher,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open a connection for `key` and start supervising it.
    ///
    /// The returned handle is already `Connecting`. Must be called from
    /// within a tokio runtime.
    pub fn open(&self, key: StreamKey) -> ConnectionHandle {
        let slot = self.dispatcher.attach(&key);
        let snapshots = slot.subscribe();
        let mut initial = ConnectionStatus::default();
        initial.transition(ConnectionState::Connecting);
        let status = Arc::new(watch::Sender::new(initial));
        let cancel = CancellationToken::new();

        tracing::debug!(key = %key, "supervisor: opening connection");

        let task = ConnectionTask {
            key: key.clone(),
            transport: Arc::clone(&self.transport),
            dispatcher: Arc::clone(&self.dispatcher),
            slot: Arc::clone(&slot),
            status: Arc::clone(&status),
            cancel: cancel.clone(),
            tracker: RetryTracker::new(self.policy.clone()),
        };
        tokio::spawn(task.run());

        ConnectionHandle {
            key,
            slot_id: slot.id(),
            status,
            snapshots,
            cancel,
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

// ─── Handle ──────────────────────────────────────────────────────

/// Owner's view of a supervised connection. Dropping it closes the connection.
pub struct ConnectionHandle {
    key: StreamKey,
    slot_id: u64,
    status: Arc<watch::Sender<ConnectionStatus>>,
    snapshots: watch::Receiver<Snapshot>,
    cancel: CancellationToken,
    dispatcher: Arc<EventDispatcher>,
}

impl ConnectionHandle {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Move to `Closed` now, cancel any pending retry and let the task
    /// release the transport. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        let closed = self.status.send_if_modified(|status| status.transition(ConnectionState::Closed));
        self.cancel.cancel();
        self.dispatcher.detach(&self.key, self.slot_id);
        if closed {
            tracing::debug!(key = %self.key, "supervisor: connection closed");
        }
        closed
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

// ─── Task ────────────────────────────────────────────────────────

enum SessionEnd {
    Cancelled,
    Rejected(String),
    Lost(String),
}

struct ConnectionTask {
    key: StreamKey,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    slot: Arc<SnapshotSlot>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    cancel: CancellationToken,
    tracker: RetryTracker,
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            match self.session().await {
                SessionEnd::Cancelled => break,
                SessionEnd::Rejected(reason) => {
                    tracing::warn!(key = %self.key, reason = %reason, "supervisor: identity rejected");
                    self.fail(StreamFailure::AuthRejected { reason });
                    break;
                }
                SessionEnd::Lost(reason) => {
                    if !self.set_state(ConnectionState::Errored) {
                        break;
                    }
                    match self.tracker.record_failure() {
                        RetryDecision::GiveUp { attempts } => {
                            tracing::warn!(key = %self.key, attempts, reason = %reason, "supervisor: giving up");
                            self.fail(StreamFailure::RetryExhausted { attempts });
                            break;
                        }
                        RetryDecision::Retry { attempt, after_ms } => {
                            let delay_ms = jittered(after_ms, self.tracker.policy().jitter_pct, entropy());
                            tracing::info!(
                                key = %self.key,
                                attempt,
                                delay_ms,
                                reason = %reason,
                                "supervisor: connection lost, retrying"
                            );
                            tokio::select! {
                                _ = self.cancel.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                            }
                            if !self.set_state(ConnectionState::Connecting) {
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.dispatcher.detach(&self.key, self.slot.id());
    }

    /// One handshake plus the frame pump that follows it.
    async fn session(&mut self) -> SessionEnd {
        let connect = self.transport.connect(self.key.clone());
        let mut channel = tokio::select! {
            _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
            result = connect => match result {
                Ok(channel) => channel,
                Err(TransportError::AuthRejected(reason)) => return SessionEnd::Rejected(reason),
                Err(TransportError::Network(reason)) => return SessionEnd::Lost(reason),
            },
        };

        if !self.set_state(ConnectionState::Open) {
            channel.close().await;
            return SessionEnd::Cancelled;
        }
        self.tracker.record_success();
        tracing::info!(key = %self.key, "supervisor: connection open");

        let end = self.pump(&mut channel).await;
        channel.close().await;
        end
    }

    async fn pump(&self, channel: &mut Box<dyn FeedChannel>) -> SessionEnd {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                next = channel.next_frame() => match next {
                    Some(Ok(raw)) => {
                        self.dispatcher.deliver(&self.slot, &raw);
                    }
                    Some(Err(TransportError::AuthRejected(reason))) => return SessionEnd::Rejected(reason),
                    Some(Err(TransportError::Network(reason))) => return SessionEnd::Lost(reason),
                    None => return SessionEnd::Lost("server ended the stream".into()),
                },
            }
        }
    }

    /// Apply a state-machine edge. `false` means the connection was closed meanwhile.
    fn set_state(&self, next: ConnectionState) -> bool {
        self.status.send_if_modified(|status| status.transition(next))
    }

    fn fail(&self, failure: StreamFailure) {
        self.status.send_if_modified(|status| status.fail(failure));
    }
}

/// Jitter entropy from the wall clock's sub-second nanos.
fn entropy() -> u64 {
    u64::from(chrono::Utc::now().timestamp_subsec_nanos())
}
