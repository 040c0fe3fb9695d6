//! Connection lifecycle state machine.
//!
//! ```text
//! Idle ──▶ Connecting ──▶ Open
//!             ▲   │         │
//!             │   ▼         ▼
//!             └─ Errored ◀──┘
//!
//! any ──▶ Closed   (final)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Transient failure; a retry is scheduled.
    Errored,
    Closed,
}

impl ConnectionState {
    /// Whether `self → next` is an edge of the state machine.
    ///
    /// `Closed` has no outgoing edges, including to itself.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Open)
                | (Connecting, Errored)
                | (Open, Errored)
                | (Errored, Connecting)
                | (Idle | Connecting | Open | Errored, Closed)
        )
    }

    /// Connecting, Open or waiting to retry.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Errored)
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Errored => "errored",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Terminal reason a connection closed on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamFailure {
    /// The server rejected the identity. Never retried.
    AuthRejected { reason: String },
    /// Transient failures exceeded the retry cap.
    RetryExhausted { attempts: u32 },
}

impl fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthRejected { reason } => write!(f, "authorization rejected: {reason}"),
            Self::RetryExhausted { attempts } => {
                write!(f, "stream unavailable after {attempts} failed attempts")
            }
        }
    }
}

/// Observable status of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive transient failures since the last successful handshake.
    pub failures: u32,
    /// Set only together with `Closed`, at most once per connection.
    pub failure: Option<StreamFailure>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            failures: 0,
            failure: None,
        }
    }
}

impl ConnectionStatus {
    /// Apply a transition in place. Returns `false` (and leaves `self` as is)
    /// for edges the state machine does not allow.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        match next {
            ConnectionState::Open => self.failures = 0,
            ConnectionState::Errored => self.failures = self.failures.saturating_add(1),
            _ => {}
        }
        true
    }

    /// Close with a terminal failure. No-op when already closed.
    pub fn fail(&mut self, failure: StreamFailure) -> bool {
        if !self.transition(ConnectionState::Closed) {
            return false;
        }
        self.failure = Some(failure);
        true
    }

    /// Closed by a terminal failure rather than by teardown.
    pub fn is_unavailable(&self) -> bool {
        self.state.is_closed() && self.failure.is_some()
    }

    /// Closed by an explicit release (dispose or identity change), without a failure.
    pub fn is_torn_down(&self) -> bool {
        self.state.is_closed() && self.failure.is_none()
    }
}
