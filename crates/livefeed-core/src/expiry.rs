//! Verification-code expiry window.
//!
//! The window is nothing but two server-issued epoch-millisecond timestamps.
//! Remaining time is recomputed from them on every call, so a window rebuilt
//! after a reload reads exactly the same as one that never went away.

use serde::{Deserialize, Serialize};

/// `None` on either side means there is no active window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryWindow {
    pub created_at_ms: Option<i64>,
    pub expires_at_ms: Option<i64>,
}

impl ExpiryWindow {
    pub fn new(created_at_ms: i64, expires_at_ms: i64) -> Self {
        Self {
            created_at_ms: Some(created_at_ms),
            expires_at_ms: Some(expires_at_ms),
        }
    }

    pub fn cleared() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.created_at_ms.is_some() && self.expires_at_ms.is_some()
    }

    /// `max(0, floor((expires_at - now) / 1000))`; zero without an active window.
    pub fn remaining_secs(&self, now_ms: i64) -> u64 {
        match (self.created_at_ms, self.expires_at_ms) {
            (Some(_), Some(expires_at)) => {
                let left_ms = expires_at.saturating_sub(now_ms).max(0);
                (left_ms / 1_000) as u64
            }
            _ => 0,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.is_active() && self.remaining_secs(now_ms) == 0
    }

    /// Full length of the window in whole seconds.
    pub fn duration_secs(&self) -> Option<u64> {
        let span = self.expires_at_ms?.saturating_sub(self.created_at_ms?);
        Some((span.max(0) / 1_000) as u64)
    }

    /// `MM:SS` rendering of the remaining time, e.g. `01:59`.
    pub fn remaining_label(&self, now_ms: i64) -> String {
        format_mm_ss(self.remaining_secs(now_ms))
    }
}

pub fn format_mm_ss(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

// ─── Countdown ───────────────────────────────────────────────────

/// Result of one countdown tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownTick {
    /// No active window.
    Idle,
    /// Window still open.
    Running { remaining_secs: u64 },
    /// First tick at which the window reached zero. Reported exactly once.
    Expired,
    /// Already reported `Expired`; the window stays at zero.
    Finished,
}

impl CountdownTick {
    pub fn remaining_secs(self) -> u64 {
        match self {
            Self::Running { remaining_secs } => remaining_secs,
            Self::Idle | Self::Expired | Self::Finished => 0,
        }
    }

    /// Whether the cadence driving this countdown should keep ticking.
    pub fn keeps_ticking(self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

/// Exactly-once expiry detection on top of an [`ExpiryWindow`].
#[derive(Debug, Clone, Default)]
pub struct ExpiryCountdown {
    window: ExpiryWindow,
    expired: bool,
}

impl ExpiryCountdown {
    pub fn new(window: ExpiryWindow) -> Self {
        Self {
            window,
            expired: false,
        }
    }

    pub fn window(&self) -> ExpiryWindow {
        self.window
    }

    pub fn tick(&mut self, now_ms: i64) -> CountdownTick {
        if !self.window.is_active() {
            return CountdownTick::Idle;
        }
        if self.expired {
            return CountdownTick::Finished;
        }
        match self.window.remaining_secs(now_ms) {
            0 => {
                self.expired = true;
                CountdownTick::Expired
            }
            remaining_secs => CountdownTick::Running { remaining_secs },
        }
    }

    pub fn has_expired(&self) -> bool {
        self.expired
    }
}
