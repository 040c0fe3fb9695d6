use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use http::header::AUTHORIZATION;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use livefeed_core::{ControlMessage, Identity, StreamKey};

use super::{FeedChannel, Transport};
use crate::config::FeedConfig;
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close codes the server uses to revoke an identity mid-stream.
const AUTH_CLOSE_CODES: [u16; 3] = [1008, 4001, 4003];

const ACCOUNT_HEADER: &str = "x-account-id";

/// WebSocket transport: one socket per stream key.
///
/// The handshake carries `Authorization: Bearer <token>` and `X-Account-Id`;
/// once upgraded, a subscribe control message names the topic.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(config.url.clone(), config.connect_timeout())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    fn connect(&self, key: StreamKey) -> BoxFuture<'static, Result<Box<dyn FeedChannel>, TransportError>> {
        let url = self.url.clone();
        let timeout = self.connect_timeout;
        async move {
            let request = build_request(&url, &key.identity)?;
            let (mut stream, _response) = match tokio::time::timeout(timeout, connect_async(request)).await {
                Err(_) => {
                    return Err(TransportError::Network(format!(
                        "handshake timed out after {}ms",
                        timeout.as_millis()
                    )));
                }
                Ok(Err(e)) => return Err(classify_handshake_error(e)),
                Ok(Ok(pair)) => pair,
            };

            let subscribe = ControlMessage::subscribe(&key).to_json();
            stream
                .send(Message::Text(subscribe))
                .await
                .map_err(TransportError::network)?;
            tracing::debug!(key = %key, "ws: subscribed");

            let channel: Box<dyn FeedChannel> = Box::new(WsChannel { stream, key });
            Ok(channel)
        }
        .boxed()
    }
}

fn build_request(url: &str, identity: &Identity) -> Result<Request, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::Network(format!("invalid url {url}: {e}")))?;

    let bearer = HeaderValue::from_str(&format!("Bearer {}", identity.token))
        .map_err(|_| TransportError::AuthRejected("token is not a valid header value".into()))?;
    let account = HeaderValue::from_str(&identity.account_id)
        .map_err(|_| TransportError::AuthRejected("account id is not a valid header value".into()))?;

    let headers = request.headers_mut();
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(ACCOUNT_HEADER, account);
    Ok(request)
}

/// HTTP 401/403 on the upgrade means the identity was refused.
fn classify_handshake_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
                TransportError::AuthRejected(format!("upgrade answered {status}"))
            } else {
                TransportError::Network(format!("upgrade answered {status}"))
            }
        }
        other => TransportError::network(other),
    }
}

fn close_outcome(frame: Option<CloseFrame<'_>>) -> Option<Result<String, TransportError>> {
    let frame = frame?;
    let code = u16::from(frame.code);
    if AUTH_CLOSE_CODES.contains(&code) {
        return Some(Err(TransportError::AuthRejected(format!(
            "closed with {code}: {}",
            frame.reason
        ))));
    }
    None
}

struct WsChannel {
    stream: WsStream,
    key: StreamKey,
}

impl FeedChannel for WsChannel {
    fn next_frame(&mut self) -> BoxFuture<'_, Option<Result<String, TransportError>>> {
        async move {
            loop {
                let message = match self.stream.next().await {
                    Some(message) => message,
                    None => return None,
                };
                match message {
                    Ok(Message::Text(text)) => return Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => return Some(Ok(text)),
                        Err(_) => {
                            tracing::debug!(key = %self.key, "ws: dropping non-utf8 binary frame");
                        }
                    },
                    Ok(Message::Close(frame)) => return close_outcome(frame),
                    // Ping/pong are answered by tungstenite on the next read.
                    Ok(_) => {}
                    Err(e) => return Some(Err(TransportError::network(e))),
                }
            }
        }
        .boxed()
    }

    fn close(mut self: Box<Self>) -> BoxFuture<'static, ()> {
        async move {
            let unsubscribe = ControlMessage::unsubscribe(&self.key).to_json();
            if let Err(e) = self.stream.send(Message::Text(unsubscribe)).await {
                tracing::debug!(key = %self.key, error = %e, "ws: unsubscribe not sent");
            }
            if let Err(e) = self.stream.close(None).await {
                tracing::debug!(key = %self.key, error = %e, "ws: close handshake failed");
            }
        }
        .boxed()
    }
}
