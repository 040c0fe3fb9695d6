//! Push-frame codec.
//!
//! Inbound frames are JSON objects `{"type": ..., "payload": ...}`. Any
//! frame that fails to decode (unknown `type`, missing payload, wrong field
//! types) is a [`FrameError`]; callers drop it and keep the snapshot as is.
//!
//! Outbound control messages name the topic once per connection open/close.

use serde::{Deserialize, Deserializer, Serialize};

use crate::types::StreamKey;

// ─── Errors ──────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{frame} frame does not apply to topic {topic}")]
    TopicMismatch { frame: &'static str, topic: String },

    #[error("frame for account {got} arrived on a stream for account {expected}")]
    AccountMismatch { expected: String, got: String },
}

// ─── Inbound ─────────────────────────────────────────────────────

/// Partial account telemetry. Absent fields leave the snapshot untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub margin: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub equity: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(
        default,
        alias = "unrealizedPnL",
        alias = "unrealized_pnl",
        deserialize_with = "lenient_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub unrealized_pnl: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub leverage: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub credit: Option<f64>,
}

/// Partial quote for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteUpdate {
    pub symbol: String,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub last: Option<f64>,
    #[serde(default, alias = "ts", skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
}

/// A decoded push frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    Account(AccountUpdate),
    Quote(QuoteUpdate),
    Quotes(Vec<QuoteUpdate>),
    Heartbeat(HeartbeatPayload),
}

/// Heartbeats carry nothing the client reads. Any payload, or none, is accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatPayload;

impl<'de> Deserialize<'de> for HeartbeatPayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<serde::de::IgnoredAny>::deserialize(deserializer).map(|_| HeartbeatPayload)
    }
}

impl Frame {
    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Account(_) => "account",
            Self::Quote(_) => "quote",
            Self::Quotes(_) => "quotes",
            Self::Heartbeat(_) => "heartbeat",
        }
    }
}

/// Decode a raw text frame.
pub fn parse_frame(raw: &str) -> Result<Frame, FrameError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(FrameError::Empty);
    }
    Ok(serde_json::from_str(raw)?)
}

/// Accept a JSON number or a numeric string; brokers send both.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
    }

    match Option::<NumOrStr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumOrStr::Num(n)) => Ok(Some(n)),
        Some(NumOrStr::Str(s)) => {
            let n: f64 = s.trim().parse().map_err(serde::de::Error::custom)?;
            if n.is_finite() {
                Ok(Some(n))
            } else {
                Err(serde::de::Error::custom("non-finite number"))
            }
        }
    }
}

// ─── Outbound ────────────────────────────────────────────────────

/// Control message sent once per connection open and once per close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlMessage {
    Subscribe {
        topic: String,
        #[serde(rename = "accountId")]
        account_id: String,
    },
    Unsubscribe {
        topic: String,
    },
}

impl ControlMessage {
    pub fn subscribe(key: &StreamKey) -> Self {
        Self::Subscribe {
            topic: key.topic.to_string(),
            account_id: key.identity.account_id.clone(),
        }
    }

    pub fn unsubscribe(key: &StreamKey) -> Self {
        Self::Unsubscribe {
            topic: key.topic.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
