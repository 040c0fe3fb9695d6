//! livefeed-runtime: live account telemetry and quote streams.
//!
//! Components, leaf first:
//!
//! - [`EventDispatcher`] parses raw frames and publishes coalesced snapshots.
//! - [`ConnectionSupervisor`] runs one reconnecting task per stream key.
//! - [`SubscriptionRegistry`] reference-counts interest per key.
//! - [`AuthGate`] owns the active identity and tears down stale connections.
//! - [`ExpiryWindowTimer`] counts down verification-code windows.
//!
//! [`LiveFeed`] wires the first four to one [`Transport`].

pub mod auth_gate;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod expiry_timer;
pub mod feed;
pub mod registry;
pub mod supervisor;
pub mod transport;

pub use auth_gate::{AuthGate, IdentityChange};
pub use config::FeedConfig;
pub use dispatcher::{DispatchOutcome, DropReason, EventDispatcher};
pub use error::{ConfigError, FeedError, TransportError};
pub use expiry_timer::{Clock, ExpiryWindowTimer, ManualClock, SystemClock};
pub use feed::{Follower, LiveFeed};
pub use registry::{Disposer, EventStream, FeedEvent, Subscription, SubscriptionRegistry};
pub use supervisor::{ConnectionHandle, ConnectionSupervisor};
pub use transport::{FeedChannel, MemoryTransport, Transport, WsTransport};
