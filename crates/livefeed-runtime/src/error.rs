//! Error types for the runtime layer.

use thiserror::Error;

/// Failure reported by a transport, at handshake or mid-stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The server refused the identity. Terminal for that identity.
    #[error("identity rejected: {0}")]
    AuthRejected(String),

    /// Anything else: refused connection, timeout, reset, dropped stream.
    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    pub fn network(detail: impl std::fmt::Display) -> Self {
        Self::Network(detail.to_string())
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }
}

/// Errors returned to callers of the subscription API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("no identity is set; streams cannot open while logged out")]
    NoIdentity,

    #[error("{requested} is not the active identity")]
    IdentityMismatch { requested: String },
}

/// Errors loading or validating a [`FeedConfig`](crate::config::FeedConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
