//! AuthGate: the single owner of the active identity.
//!
//! The identity is published on a `watch` channel read by the registry and
//! the dispatcher. A change is published first, so frames for the old
//! identity are dropped from that moment on, and then every connection
//! keyed by the old identity is closed.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use livefeed_core::Identity;

use crate::registry::SubscriptionRegistry;

/// How `set_identity` changed the active identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityChange {
    /// Equal to the current identity (or both absent).
    Unchanged,
    LoggedIn,
    /// Token or account id changed while logged in.
    Switched,
    LoggedOut,
}

impl fmt::Display for IdentityChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unchanged => "unchanged",
            Self::LoggedIn => "logged_in",
            Self::Switched => "switched",
            Self::LoggedOut => "logged_out",
        };
        f.write_str(s)
    }
}

pub struct AuthGate {
    tx: watch::Sender<Option<Identity>>,
    registry: Arc<SubscriptionRegistry>,
}

impl AuthGate {
    pub fn new(tx: watch::Sender<Option<Identity>>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { tx, registry }
    }

    /// Replace the active identity. `None` or an identity with an empty field logs out.
    pub fn set_identity(&self, identity: Option<Identity>) -> IdentityChange {
        let next = Identity::present(identity);
        let mut change = IdentityChange::Unchanged;
        self.tx.send_if_modified(|current| {
            change = match (current.as_ref(), next.as_ref()) {
                (Some(old), Some(new)) if old == new => return false,
                (None, None) => return false,
                (None, Some(_)) => IdentityChange::LoggedIn,
                (Some(_), Some(_)) => IdentityChange::Switched,
                (Some(_), None) => IdentityChange::LoggedOut,
            };
            current.clone_from(&next);
            true
        });
        if change == IdentityChange::Unchanged {
            return change;
        }

        let closed = self.registry.retain_identity(next.as_ref());
        match &next {
            Some(identity) => tracing::info!(%identity, %change, closed, "auth: identity set"),
            None => tracing::info!(%change, closed, "auth: logged out"),
        }
        change
    }

    pub fn current(&self) -> Option<Identity> {
        self.tx.borrow().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Receiver that is notified on every identity change.
    pub fn watch(&self) -> watch::Receiver<Option<Identity>> {
        self.tx.subscribe()
    }
}
