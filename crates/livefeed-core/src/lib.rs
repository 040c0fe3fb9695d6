//! livefeed-core: identity, topic and snapshot types, the push-frame codec,
//! and the pure state machines (connection lifecycle, retry backoff, expiry
//! window) behind the live telemetry layer.
//!
//! Nothing in this crate performs IO or reads a clock; all time values are
//! passed in as epoch milliseconds.

pub mod expiry;
pub mod frame;
pub mod retry;
pub mod snapshot;
pub mod state;
pub mod types;

pub use expiry::{CountdownTick, ExpiryCountdown, ExpiryWindow, format_mm_ss};
pub use frame::{AccountUpdate, ControlMessage, Frame, FrameError, HeartbeatPayload, QuoteUpdate, parse_frame};
pub use retry::{RetryDecision, RetryPolicy, RetryTracker, jittered};
pub use snapshot::{AccountSnapshot, Quote, QuoteBook, Snapshot};
pub use state::{ConnectionState, ConnectionStatus, StreamFailure};
pub use types::{Identity, StreamKey, Topic, TopicParseError};
