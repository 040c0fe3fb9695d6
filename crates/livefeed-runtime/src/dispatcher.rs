//! EventDispatcher: raw frames in, coalesced snapshots out.
//!
//! Every open connection attaches one [`SnapshotSlot`]. A slot owns the
//! `watch` sender for its stream, so consumers always read the latest merged
//! snapshot and a burst of frames between two reads surfaces as one change.
//! Detaching retires the slot; a retired slot accepts nothing, which keeps a
//! superseded connection task from writing into its successor's snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use livefeed_core::{FrameError, Identity, Snapshot, StreamKey, Topic, parse_frame};

// ─── Outcome ─────────────────────────────────────────────────────

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Merged and at least one field changed; consumers are notified.
    Applied,
    /// Recognized but changed nothing (heartbeat, repeated values).
    Unchanged,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not a frame we understand.
    Malformed,
    /// Wrong topic or wrong account for this stream.
    Mismatched,
    /// The stream's identity is no longer the active one.
    StaleIdentity,
    /// No attached slot for this stream.
    Detached,
}

// ─── Slot ────────────────────────────────────────────────────────

pub(crate) struct SnapshotSlot {
    id: u64,
    key: StreamKey,
    tx: watch::Sender<Snapshot>,
    retired: AtomicBool,
}

impl SnapshotSlot {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────

pub struct EventDispatcher {
    identity: watch::Receiver<Option<Identity>>,
    slots: Mutex<HashMap<StreamKey, Arc<SnapshotSlot>>>,
    next_slot: AtomicU64,
    dropped: AtomicU64,
}

impl EventDispatcher {
    /// `identity` is the gate's channel; frames for any other identity are dropped.
    pub fn new(identity: watch::Receiver<Option<Identity>>) -> Self {
        Self {
            identity,
            slots: Mutex::new(HashMap::new()),
            next_slot: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StreamKey, Arc<SnapshotSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a fresh, all-unknown slot for `key`, retiring any previous one.
    pub(crate) fn attach(&self, key: &StreamKey) -> Arc<SnapshotSlot> {
        let (tx, _) = watch::channel(Snapshot::empty(&key.topic));
        let slot = Arc::new(SnapshotSlot {
            id: self.next_slot.fetch_add(1, Ordering::Relaxed),
            key: key.clone(),
            tx,
            retired: AtomicBool::new(false),
        });
        if let Some(previous) = self.lock().insert(key.clone(), Arc::clone(&slot)) {
            previous.retire();
        }
        slot
    }

    /// Retire slot `slot_id` of `key`. A newer slot for the same key is left alone.
    pub(crate) fn detach(&self, key: &StreamKey, slot_id: u64) {
        let mut slots = self.lock();
        if slots.get(key).is_some_and(|slot| slot.id == slot_id) {
            if let Some(slot) = slots.remove(key) {
                slot.retire();
            }
        }
    }

    /// Route a raw frame to the stream attached for `key`.
    pub fn on_frame(&self, key: &StreamKey, raw: &str) -> DispatchOutcome {
        let slot = self.lock().get(key).cloned();
        match slot {
            Some(slot) => self.deliver(&slot, raw),
            None => self.drop_frame(key, DropReason::Detached, None),
        }
    }

    /// Merge a raw frame into `slot`.
    pub(crate) fn deliver(&self, slot: &SnapshotSlot, raw: &str) -> DispatchOutcome {
        if slot.is_retired() {
            return self.drop_frame(&slot.key, DropReason::Detached, None);
        }
        if self.identity.borrow().as_ref() != Some(&slot.key.identity) {
            return self.drop_frame(&slot.key, DropReason::StaleIdentity, None);
        }
        let frame = match parse_frame(raw) {
            Ok(frame) => frame,
            Err(e) => return self.drop_frame(&slot.key, DropReason::Malformed, Some(&e)),
        };

        let mut rejected = None;
        let changed = slot.tx.send_if_modified(|snapshot| match snapshot.apply(&frame, &slot.key) {
            Ok(changed) => changed,
            Err(e) => {
                rejected = Some(e);
                false
            }
        });
        match rejected {
            Some(e) => self.drop_frame(&slot.key, DropReason::Mismatched, Some(&e)),
            None if changed => DispatchOutcome::Applied,
            None => DispatchOutcome::Unchanged,
        }
    }

    fn drop_frame(&self, key: &StreamKey, reason: DropReason, error: Option<&FrameError>) -> DispatchOutcome {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        match error {
            Some(e) => tracing::debug!(key = %key, reason = ?reason, error = %e, total, "dispatcher: frame dropped"),
            None => tracing::debug!(key = %key, reason = ?reason, total, "dispatcher: frame dropped"),
        }
        DispatchOutcome::Dropped(reason)
    }

    /// Latest snapshot for `key`, if a stream is attached.
    pub fn snapshot(&self, key: &StreamKey) -> Option<Snapshot> {
        self.lock().get(key).map(|slot| slot.tx.borrow().clone())
    }

    /// Latest snapshot for `topic` under the active identity.
    ///
    /// All-unknown when logged out or when no stream for the topic is attached.
    pub fn current_snapshot(&self, topic: &Topic) -> Snapshot {
        let identity = self.identity.borrow().clone();
        identity
            .and_then(|identity| self.snapshot(&StreamKey::new(identity, topic.clone())))
            .unwrap_or_else(|| Snapshot::empty(topic))
    }

    /// Receiver for `key`'s snapshot channel. Ends when the stream detaches.
    pub fn watch(&self, key: &StreamKey) -> Option<watch::Receiver<Snapshot>> {
        self.lock().get(key).map(|slot| slot.subscribe())
    }

    pub fn active_streams(&self) -> usize {
        self.lock().len()
    }

    /// Frames dropped since startup, for any reason.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(account: &str) -> StreamKey {
        StreamKey::new(Identity::new("tok", account), Topic::Account)
    }

    fn logged_in(account: &str) -> (watch::Sender<Option<Identity>>, EventDispatcher) {
        let (tx, rx) = watch::channel(Some(Identity::new("tok", account)));
        (tx, EventDispatcher::new(rx))
    }

    fn margin(snapshot: Option<Snapshot>) -> Option<f64> {
        snapshot.and_then(|s| s.as_account().and_then(|a| a.margin))
    }

    #[test]
    fn frames_merge_into_attached_slot() {
        let (_tx, dispatcher) = logged_in("acct1");
        let key = key("acct1");
        dispatcher.attach(&key);

        let outcome = dispatcher.on_frame(&key, r#"{"type":"account","payload":{"margin":10}}"#);
        assert_eq!(outcome, DispatchOutcome::Applied);
        assert_eq!(margin(dispatcher.snapshot(&key)), Some(10.0));
        for heartbeat in [r#"{"type":"heartbeat"}"#, r#"{"type":"heartbeat","payload":{}}"#] {
            assert_eq!(dispatcher.on_frame(&key, heartbeat), DispatchOutcome::Unchanged);
        }
        assert_eq!(dispatcher.dropped_frames(), 0);
        assert_eq!(margin(dispatcher.snapshot(&key)), Some(10.0));
    }

    #[test]
    fn malformed_frame_changes_nothing() {
        let (_tx, dispatcher) = logged_in("acct1");
        let key = key("acct1");
        let slot = dispatcher.attach(&key);
        let mut rx = slot.subscribe();

        dispatcher.on_frame(&key, r#"{"type":"account","payload":{"margin":10}}"#);
        rx.borrow_and_update();

        for raw in [r#"{"type":"unknown_xyz"}"#, "", "not json", r#"{"payload":{}}"#] {
            assert_eq!(
                dispatcher.on_frame(&key, raw),
                DispatchOutcome::Dropped(DropReason::Malformed)
            );
        }
        assert!(!rx.has_changed().unwrap());
        assert_eq!(margin(dispatcher.snapshot(&key)), Some(10.0));
        assert_eq!(dispatcher.dropped_frames(), 4);
    }

    #[test]
    fn burst_coalesces_to_latest_value() {
        let (_tx, dispatcher) = logged_in("acct1");
        let key = key("acct1");
        let slot = dispatcher.attach(&key);
        let mut rx = slot.subscribe();

        for m in [10, 20, 30] {
            dispatcher.on_frame(&key, &format!(r#"{{"type":"account","payload":{{"margin":{m}}}}}"#));
        }
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_account().unwrap().margin, Some(30.0));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn stale_identity_frames_are_dropped() {
        let (tx, dispatcher) = logged_in("acct1");
        let key = key("acct1");
        dispatcher.attach(&key);

        tx.send_replace(Some(Identity::new("tok2", "acct2")));
        assert_eq!(
            dispatcher.on_frame(&key, r#"{"type":"account","payload":{"margin":10}}"#),
            DispatchOutcome::Dropped(DropReason::StaleIdentity)
        );
        assert_eq!(margin(dispatcher.snapshot(&key)), None);
    }

    #[test]
    fn foreign_account_frame_is_mismatched() {
        let (_tx, dispatcher) = logged_in("acct1");
        let key = key("acct1");
        dispatcher.attach(&key);
        assert_eq!(
            dispatcher.on_frame(&key, r#"{"type":"account","payload":{"accountId":"acct9","margin":1}}"#),
            DispatchOutcome::Dropped(DropReason::Mismatched)
        );
    }

    #[test]
    fn retired_slot_rejects_writes() {
        let (_tx, dispatcher) = logged_in("acct1");
        let key = key("acct1");
        let old = dispatcher.attach(&key);
        let new = dispatcher.attach(&key);

        let raw = r#"{"type":"account","payload":{"margin":5}}"#;
        assert_eq!(dispatcher.deliver(&old, raw), DispatchOutcome::Dropped(DropReason::Detached));
        assert_eq!(dispatcher.deliver(&new, raw), DispatchOutcome::Applied);

        // Detaching the superseded slot leaves the live one attached.
        dispatcher.detach(&key, old.id());
        assert_eq!(dispatcher.active_streams(), 1);
        dispatcher.detach(&key, new.id());
        assert_eq!(dispatcher.active_streams(), 0);
        assert_eq!(dispatcher.on_frame(&key, raw), DispatchOutcome::Dropped(DropReason::Detached));
    }

    #[test]
    fn current_snapshot_follows_active_identity() {
        let (tx, dispatcher) = logged_in("acct1");
        let key = key("acct1");
        dispatcher.attach(&key);
        dispatcher.on_frame(&key, r#"{"type":"account","payload":{"equity":100}}"#);

        let current = dispatcher.current_snapshot(&Topic::Account);
        assert_eq!(current.as_account().unwrap().equity, Some(100.0));

        tx.send_replace(None);
        assert!(dispatcher.current_snapshot(&Topic::Account).is_unknown());
    }
}
