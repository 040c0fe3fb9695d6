//! Transport seam between the connection supervisor and the network.
//!
//! A [`Transport`] performs the handshake for one stream key and hands back
//! a [`FeedChannel`] that yields raw text frames. Both traits return boxed
//! futures so the supervisor can hold them as trait objects.

use futures_util::future::BoxFuture;

use livefeed_core::StreamKey;

use crate::error::TransportError;

mod memory;
mod ws;

pub use memory::MemoryTransport;
pub use ws::WsTransport;

/// An open duplex stream for one key.
pub trait FeedChannel: Send {
    /// Next raw frame. `None` means the server ended the stream.
    fn next_frame(&mut self) -> BoxFuture<'_, Option<Result<String, TransportError>>>;

    /// Send the unsubscribe control message and release the connection.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Opens channels. One call per connection attempt.
pub trait Transport: Send + Sync {
    /// Handshake with `key.identity` as credentials and `key.topic` as the stream selector.
    fn connect(&self, key: StreamKey) -> BoxFuture<'static, Result<Box<dyn FeedChannel>, TransportError>>;
}
