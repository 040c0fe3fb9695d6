//! Present-state snapshots with last-value-wins merge.
//!
//! Every numeric field starts as `None`, meaning "unknown": a value the
//! server has not reported yet, distinct from a reported zero.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::frame::{AccountUpdate, Frame, FrameError, QuoteUpdate};
use crate::types::{StreamKey, Topic};

/// Overwrite `slot` with `incoming` when present. Returns whether it changed.
fn merge<T: PartialEq + Copy>(slot: &mut Option<T>, incoming: Option<T>) -> bool {
    match incoming {
        Some(value) if *slot != Some(value) => {
            *slot = Some(value);
            true
        }
        _ => false,
    }
}

// ─── Account ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub margin: Option<f64>,
    pub equity: Option<f64>,
    pub balance: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub leverage: Option<f64>,
    pub credit: Option<f64>,
}

impl AccountSnapshot {
    pub fn apply(&mut self, update: &AccountUpdate) -> bool {
        // Non-short-circuiting `|` so every field is merged.
        merge(&mut self.margin, update.margin)
            | merge(&mut self.equity, update.equity)
            | merge(&mut self.balance, update.balance)
            | merge(&mut self.unrealized_pnl, update.unrealized_pnl)
            | merge(&mut self.leverage, update.leverage)
            | merge(&mut self.credit, update.credit)
    }

    /// No field has been reported yet.
    pub fn is_unknown(&self) -> bool {
        *self == Self::default()
    }

    /// Equity not tied up as margin.
    pub fn free_margin(&self) -> Option<f64> {
        Some(self.equity? - self.margin?)
    }

    /// Equity / margin as a percentage. Unknown when no margin is used.
    pub fn margin_level_pct(&self) -> Option<f64> {
        let margin = self.margin?;
        if margin <= 0.0 {
            return None;
        }
        Some(self.equity? / margin * 100.0)
    }
}

// ─── Quotes ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub timestamp_ms: Option<i64>,
}

impl Quote {
    fn apply(&mut self, update: &QuoteUpdate) -> bool {
        merge(&mut self.bid, update.bid)
            | merge(&mut self.ask, update.ask)
            | merge(&mut self.last, update.last)
            | merge(&mut self.timestamp_ms, update.timestamp_ms)
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.ask? - self.bid?)
    }
}

/// Latest quote per symbol. Symbols appear once their first update arrives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteBook {
    pub quotes: BTreeMap<String, Quote>,
}

impl QuoteBook {
    /// Merge one update. Symbols outside `topic` are ignored.
    pub fn apply(&mut self, update: &QuoteUpdate, topic: &Topic) -> bool {
        if !topic.contains_symbol(&update.symbol) {
            return false;
        }
        let symbol = update.symbol.trim().to_ascii_uppercase();
        match self.quotes.get_mut(&symbol) {
            Some(quote) => quote.apply(update),
            None => {
                let mut quote = Quote::default();
                if !quote.apply(update) {
                    return false;
                }
                self.quotes.insert(symbol, quote);
                true
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&Quote> {
        self.quotes.get(&symbol.to_ascii_uppercase())
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

// ─── Snapshot ────────────────────────────────────────────────────

/// Latest merged view of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Snapshot {
    Account(AccountSnapshot),
    Quotes(QuoteBook),
}

impl Snapshot {
    /// The all-unknown snapshot a connection starts with.
    pub fn empty(topic: &Topic) -> Self {
        match topic {
            Topic::Account => Self::Account(AccountSnapshot::default()),
            Topic::Quotes { .. } => Self::Quotes(QuoteBook::default()),
        }
    }

    /// Merge a decoded frame arriving on `key`'s stream.
    ///
    /// Returns `Ok(true)` when any field changed. Errors leave `self` untouched.
    pub fn apply(&mut self, frame: &Frame, key: &StreamKey) -> Result<bool, FrameError> {
        match (self, frame) {
            (_, Frame::Heartbeat(_)) => Ok(false),
            (Self::Account(snapshot), Frame::Account(update)) => {
                if let Some(got) = update.account_id.as_deref() {
                    if got != key.identity.account_id {
                        return Err(FrameError::AccountMismatch {
                            expected: key.identity.account_id.clone(),
                            got: got.to_owned(),
                        });
                    }
                }
                Ok(snapshot.apply(update))
            }
            (Self::Quotes(book), Frame::Quote(update)) => Ok(book.apply(update, &key.topic)),
            (Self::Quotes(book), Frame::Quotes(updates)) => Ok(updates
                .iter()
                .fold(false, |changed, update| book.apply(update, &key.topic) | changed)),
            (_, other) => Err(FrameError::TopicMismatch {
                frame: other.kind(),
                topic: key.topic.to_string(),
            }),
        }
    }

    pub fn as_account(&self) -> Option<&AccountSnapshot> {
        match self {
            Self::Account(snapshot) => Some(snapshot),
            Self::Quotes(_) => None,
        }
    }

    pub fn as_quotes(&self) -> Option<&QuoteBook> {
        match self {
            Self::Quotes(book) => Some(book),
            Self::Account(_) => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        match self {
            Self::Account(snapshot) => snapshot.is_unknown(),
            Self::Quotes(book) => book.is_empty(),
        }
    }
}
