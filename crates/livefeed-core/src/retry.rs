//! Reconnect policy: capped exponential backoff with a retry cap.
//!
//! Pure, deterministic: the tracker returns pre-jitter delays and the
//! caller applies [`jittered`] with whatever entropy it has.

use serde::{Deserialize, Serialize};

/// Backoff configuration for a supervised connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry in milliseconds (default 500).
    pub initial_backoff_ms: u64,
    /// Backoff multiplier per attempt (default 2.0).
    pub multiplier: f64,
    /// Upper bound on a single delay in milliseconds (default 30000).
    pub max_backoff_ms: u64,
    /// Jitter as a fraction of the delay, applied both ways (default 0.20 = +/-20%).
    pub jitter_pct: f64,
    /// Consecutive transient failures tolerated before giving up (default 8).
    /// Zero means every transient failure is terminal.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
            jitter_pct: 0.20,
            max_retries: 8,
        }
    }
}

impl RetryPolicy {
    /// Pre-jitter delay for zero-based `attempt`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = (self.initial_backoff_ms as f64) * self.multiplier.max(1.0).powi(exponent);
        if !raw.is_finite() || raw >= self.max_backoff_ms as f64 {
            return self.max_backoff_ms;
        }
        raw as u64
    }
}

/// Decision after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `after_ms` (before jitter). `attempt` is 1-based.
    Retry { attempt: u32, after_ms: u64 },
    /// Retry cap reached after `attempts` consecutive failures.
    GiveUp { attempts: u32 },
}

/// Counts consecutive transient failures for one connection.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    policy: RetryPolicy,
    failures: u32,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.policy.max_retries {
            return RetryDecision::GiveUp {
                attempts: self.failures,
            };
        }
        RetryDecision::Retry {
            attempt: self.failures,
            after_ms: self.policy.backoff_ms(self.failures - 1),
        }
    }

    /// A handshake succeeded: the next failure starts from the initial delay.
    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Spread `delay_ms` by up to `+/- jitter_pct`, picking the offset from `entropy`.
///
/// The result never exceeds `delay_ms * (1 + jitter_pct)` and never goes below zero.
pub fn jittered(delay_ms: u64, jitter_pct: f64, entropy: u64) -> u64 {
    let pct = jitter_pct.clamp(0.0, 1.0);
    let span = (delay_ms as f64 * pct) as u64;
    if span == 0 {
        return delay_ms;
    }
    let offset = entropy % (2 * span + 1);
    (delay_ms + offset).saturating_sub(span)
}
