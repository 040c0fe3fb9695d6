use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{self, BoxFuture, FutureExt};
use tokio::sync::mpsc;

use livefeed_core::{ControlMessage, StreamKey};

use super::{FeedChannel, Transport};
use crate::error::TransportError;

type FrameSender = mpsc::UnboundedSender<Result<String, TransportError>>;

/// In-process transport driven by the caller.
///
/// Used for offline replay and tests: frames are pushed per key, handshakes
/// can be scripted to fail, and every open/close is observable.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    rejected_tokens: HashSet<String>,
    failing_handshakes: u32,
    links: HashMap<StreamKey, Vec<Link>>,
    next_link_id: u64,
    handshakes: u64,
    control_log: Vec<ControlMessage>,
}

struct Link {
    id: u64,
    tx: FrameSender,
}

impl MemoryState {
    fn remove_link(&mut self, key: &StreamKey, id: u64) {
        if let Some(links) = self.links.get_mut(key) {
            links.retain(|link| link.id != id);
            if links.is_empty() {
                self.links.remove(key);
            }
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse every handshake presenting `token`.
    pub fn reject_token(&self, token: impl Into<String>) {
        self.lock().rejected_tokens.insert(token.into());
    }

    /// Fail the next `count` handshakes with a network error.
    pub fn fail_next_handshakes(&self, count: u32) {
        self.lock().failing_handshakes = count;
    }

    /// Deliver a raw frame to every open channel for `key`. Returns how many received it.
    pub fn push(&self, key: &StreamKey, raw: impl Into<String>) -> usize {
        let raw = raw.into();
        let state = self.lock();
        state.links.get(key).map_or(0, |links| {
            links
                .iter()
                .filter(|link| link.tx.send(Ok(raw.clone())).is_ok())
                .count()
        })
    }

    /// Inject a mid-stream failure on every open channel for `key`.
    pub fn fail_stream(&self, key: &StreamKey, error: TransportError) -> usize {
        let state = self.lock();
        state.links.get(key).map_or(0, |links| {
            links
                .iter()
                .filter(|link| link.tx.send(Err(error.clone())).is_ok())
                .count()
        })
    }

    /// End every open channel for `key` as if the server hung up.
    pub fn hang_up(&self, key: &StreamKey) -> usize {
        self.lock().links.remove(key).map_or(0, |links| links.len())
    }

    /// Channels currently open for `key`.
    pub fn open_channels(&self, key: &StreamKey) -> usize {
        self.lock().links.get(key).map_or(0, Vec::len)
    }

    /// Channels currently open across all keys.
    pub fn total_open_channels(&self) -> usize {
        self.lock().links.values().map(Vec::len).sum()
    }

    /// Handshakes attempted so far, successful or not.
    pub fn handshakes(&self) -> u64 {
        self.lock().handshakes
    }

    /// Outbound control messages in send order.
    pub fn control_log(&self) -> Vec<ControlMessage> {
        self.lock().control_log.clone()
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, key: StreamKey) -> BoxFuture<'static, Result<Box<dyn FeedChannel>, TransportError>> {
        let result = {
            let mut state = self.lock();
            state.handshakes += 1;
            if state.rejected_tokens.contains(&key.identity.token) {
                Err(TransportError::AuthRejected(format!("{} refused", key.identity)))
            } else if state.failing_handshakes > 0 {
                state.failing_handshakes -= 1;
                Err(TransportError::Network("scripted handshake failure".into()))
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                state.next_link_id += 1;
                let id = state.next_link_id;
                state.links.entry(key.clone()).or_default().push(Link { id, tx });
                state.control_log.push(ControlMessage::subscribe(&key));
                let channel: Box<dyn FeedChannel> = Box::new(MemoryChannel {
                    key,
                    id,
                    rx,
                    state: Arc::clone(&self.state),
                });
                Ok(channel)
            }
        };
        future::ready(result).boxed()
    }
}

struct MemoryChannel {
    key: StreamKey,
    id: u64,
    rx: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    state: Arc<Mutex<MemoryState>>,
}

impl FeedChannel for MemoryChannel {
    fn next_frame(&mut self) -> BoxFuture<'_, Option<Result<String, TransportError>>> {
        self.rx.recv().boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .control_log
            .push(ControlMessage::unsubscribe(&self.key));
        drop(self);
        future::ready(()).boxed()
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_link(&self.key, self.id);
    }
}
