//! Identity, topic and stream-key types.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ─── Identity ────────────────────────────────────────────────────

/// Credential pair under which a live stream is authorized.
///
/// Equality is by value: re-assigning an equal identity is not a change.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub token: String,
    pub account_id: String,
}

impl Identity {
    pub fn new(token: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            account_id: account_id.into(),
        }
    }

    /// An identity missing either field cannot open streams.
    pub fn is_empty(&self) -> bool {
        self.token.trim().is_empty() || self.account_id.trim().is_empty()
    }

    /// Normalize an optional identity: empty identities become `None`.
    pub fn present(identity: Option<Identity>) -> Option<Identity> {
        identity.filter(|id| !id.is_empty())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("token", &mask_token(&self.token))
            .field("account_id", &self.account_id)
            .finish()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acct:{}", self.account_id)
    }
}

/// Keep the last four characters of a token, mask the rest.
fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{tail}", "*".repeat(chars.len() - 4))
}

// ─── Topic ───────────────────────────────────────────────────────

/// Logical stream selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topic {
    /// Margin/equity/balance telemetry for the identity's account.
    Account,
    /// Streaming quotes for a set of market symbols.
    Quotes { symbols: BTreeSet<String> },
}

impl Topic {
    /// Build a quotes topic. Symbols are trimmed and upper-cased; blanks are skipped.
    pub fn quotes<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let symbols = symbols
            .into_iter()
            .map(|s| s.as_ref().trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self::Quotes { symbols }
    }

    /// Whether `symbol` belongs to this topic. Account topics contain no symbols.
    pub fn contains_symbol(&self, symbol: &str) -> bool {
        match self {
            Self::Account => false,
            Self::Quotes { symbols } => symbols.contains(&symbol.trim().to_ascii_uppercase()),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account => f.write_str("account"),
            Self::Quotes { symbols } => {
                let joined: Vec<&str> = symbols.iter().map(String::as_str).collect();
                write!(f, "quotes:{}", joined.join(","))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicParseError {
    #[error("unknown topic '{0}' (expected 'account' or 'quotes:SYM1,SYM2')")]
    Unknown(String),
    #[error("quotes topic needs at least one symbol")]
    NoSymbols,
}

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("account") {
            return Ok(Self::Account);
        }
        match s.split_once(':') {
            Some((kind, list)) if kind.eq_ignore_ascii_case("quotes") => {
                let topic = Self::quotes(list.split(','));
                match &topic {
                    Self::Quotes { symbols } if symbols.is_empty() => Err(TopicParseError::NoSymbols),
                    _ => Ok(topic),
                }
            }
            _ => Err(TopicParseError::Unknown(s.to_owned())),
        }
    }
}

// ─── Stream Key ──────────────────────────────────────────────────

/// Registry key: one live connection exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub identity: Identity,
    pub topic: Topic,
}

impl StreamKey {
    pub fn new(identity: Identity, topic: Topic) -> Self {
        Self { identity, topic }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.identity, self.topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_equality_is_by_value() {
        let a = Identity::new("tok", "acct1");
        let b = Identity::new(String::from("tok"), String::from("acct1"));
        assert_eq!(a, b);
        assert_ne!(a, Identity::new("tok", "acct2"));
        assert_ne!(a, Identity::new("tok2", "acct1"));
    }

    #[test]
    fn empty_identity_normalizes_to_none() {
        assert!(Identity::present(Some(Identity::new("", "acct"))).is_none());
        assert!(Identity::present(Some(Identity::new("tok", "  "))).is_none());
        assert!(Identity::present(None).is_none());
        assert!(Identity::present(Some(Identity::new("tok", "acct"))).is_some());
    }

    #[test]
    fn debug_masks_token() {
        let id = Identity::new("secret-token-9876", "acct1");
        let rendered = format!("{id:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("9876"));
        assert!(rendered.contains("acct1"));
        assert_eq!(format!("{:?}", Identity::new("abc", "x")), "Identity { token: \"***\", account_id: \"x\" }");
    }

    #[test]
    fn display_never_shows_token() {
        let id = Identity::new("secret", "acct7");
        assert_eq!(id.to_string(), "acct:acct7");
    }

    #[test]
    fn topic_parse_and_display() {
        assert_eq!("account".parse::<Topic>().unwrap(), Topic::Account);
        let q: Topic = "quotes: gbpusd , EURUSD".parse().unwrap();
        assert_eq!(q.to_string(), "quotes:EURUSD,GBPUSD");
        assert!(q.contains_symbol("eurusd"));
        assert!(!q.contains_symbol("USDJPY"));
    }

    #[test]
    fn topic_parse_errors() {
        assert_eq!("quotes:".parse::<Topic>(), Err(TopicParseError::NoSymbols));
        assert_eq!("quotes: , ".parse::<Topic>(), Err(TopicParseError::NoSymbols));
        assert!(matches!("orders".parse::<Topic>(), Err(TopicParseError::Unknown(_))));
    }

    #[test]
    fn quotes_topic_is_order_insensitive() {
        assert_eq!(Topic::quotes(["B", "A"]), Topic::quotes(["a", "b"]));
    }

    #[test]
    fn stream_key_display() {
        let key = StreamKey::new(Identity::new("t", "acct1"), Topic::Account);
        assert_eq!(key.to_string(), "acct:acct1/account");
    }
}
