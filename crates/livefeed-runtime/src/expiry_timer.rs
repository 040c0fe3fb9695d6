//! ExpiryWindowTimer: drives an [`ExpiryCountdown`] at a fixed cadence.
//!
//! Inside a tokio runtime, `start` spawns a cadence task that ticks once per
//! `cadence` until the window expires or is stopped. Outside a runtime the
//! timer runs in manual mode and the caller drives [`ExpiryWindowTimer::tick`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use livefeed_core::{CountdownTick, ExpiryCountdown, ExpiryWindow, format_mm_ss};

// ─── Clocks ──────────────────────────────────────────────────────

/// Source of wall-clock epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: i64) {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

// ─── Timer ───────────────────────────────────────────────────────

type OnExpire = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TimerShared {
    countdown: ExpiryCountdown,
    on_expire: Option<OnExpire>,
    /// Bumped on every start/stop; a cadence task from an older generation stops.
    generation: u64,
    cadence: Option<CancellationToken>,
}

impl TimerShared {
    fn cancel_cadence(&mut self) {
        if let Some(token) = self.cadence.take() {
            token.cancel();
        }
    }
}

pub struct ExpiryWindowTimer {
    clock: Arc<dyn Clock>,
    cadence: Duration,
    shared: Arc<Mutex<TimerShared>>,
    remaining: Arc<watch::Sender<u64>>,
}

impl Default for ExpiryWindowTimer {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl ExpiryWindowTimer {
    pub const DEFAULT_CADENCE: Duration = Duration::from_secs(1);

    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            cadence: Self::DEFAULT_CADENCE,
            shared: Arc::new(Mutex::new(TimerShared::default())),
            remaining: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Override the tick cadence. Zero is treated as the default.
    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        if !cadence.is_zero() {
            self.cadence = cadence;
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, TimerShared> {
        lock(&self.shared)
    }

    /// Start a window from two epoch-millisecond timestamps.
    ///
    /// Any running window is replaced without firing its callback. Returns
    /// the remaining seconds at start.
    pub fn start<F>(&self, created_at_ms: i64, expires_at_ms: i64, on_expire: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        self.start_window(ExpiryWindow::new(created_at_ms, expires_at_ms), on_expire)
    }

    pub fn start_window<F>(&self, window: ExpiryWindow, on_expire: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let cadence = {
            let mut shared = self.lock();
            shared.cancel_cadence();
            shared.generation += 1;
            shared.countdown = ExpiryCountdown::new(window);
            shared.on_expire = Some(Box::new(on_expire));
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) if window.is_active() => {
                    let token = CancellationToken::new();
                    shared.cadence = Some(token.clone());
                    Some((runtime, token, shared.generation))
                }
                _ => None,
            }
        };

        let first = tick_shared(&self.shared, &self.remaining, self.clock.now_ms(), None);
        let remaining = first.map_or(0, CountdownTick::remaining_secs);
        tracing::debug!(remaining, manual = cadence.is_none(), "expiry: window started");

        if let Some((runtime, token, generation)) = cadence {
            if first.is_some_and(CountdownTick::keeps_ticking) {
                runtime.spawn(run_cadence(
                    Arc::clone(&self.shared),
                    Arc::clone(&self.remaining),
                    Arc::clone(&self.clock),
                    self.cadence,
                    token,
                    generation,
                ));
            }
        }
        remaining
    }

    /// Recompute the remaining seconds at `now_ms`, firing `on_expire` on
    /// the first tick that reaches zero.
    pub fn tick(&self, now_ms: i64) -> u64 {
        tick_shared(&self.shared, &self.remaining, now_ms, None).map_or(0, CountdownTick::remaining_secs)
    }

    /// Cancel ticking and clear the window without firing `on_expire`.
    pub fn stop(&self) {
        {
            let mut shared = self.lock();
            shared.cancel_cadence();
            shared.generation += 1;
            shared.countdown = ExpiryCountdown::default();
            shared.on_expire = None;
        }
        publish(&self.remaining, 0);
        tracing::debug!("expiry: window stopped");
    }

    pub fn window(&self) -> ExpiryWindow {
        self.lock().countdown.window()
    }

    /// Remaining seconds at the clock's current time. Does not tick.
    pub fn remaining(&self) -> u64 {
        self.window().remaining_secs(self.clock.now_ms())
    }

    /// `MM:SS` rendering of [`remaining`](Self::remaining).
    pub fn label(&self) -> String {
        format_mm_ss(self.remaining())
    }

    /// A window is active and has not expired yet.
    pub fn is_running(&self) -> bool {
        let shared = self.lock();
        shared.countdown.window().is_active() && !shared.countdown.has_expired()
    }

    /// Receiver for the remaining seconds published on every tick.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.remaining.subscribe()
    }
}

impl Drop for ExpiryWindowTimer {
    fn drop(&mut self) {
        self.lock().cancel_cadence();
    }
}

fn lock(shared: &Mutex<TimerShared>) -> MutexGuard<'_, TimerShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn publish(remaining: &watch::Sender<u64>, secs: u64) {
    remaining.send_if_modified(|current| {
        if *current == secs {
            return false;
        }
        *current = secs;
        true
    });
}

/// One tick under the lock; the expiry callback runs after the lock is released.
///
/// `generation` is `Some` for cadence ticks, which are ignored once the
/// window they were started for has been replaced.
fn tick_shared(
    shared: &Mutex<TimerShared>,
    remaining: &watch::Sender<u64>,
    now_ms: i64,
    generation: Option<u64>,
) -> Option<CountdownTick> {
    let (tick, fire) = {
        let mut shared = lock(shared);
        if generation.is_some_and(|g| g != shared.generation) {
            return None;
        }
        let tick = shared.countdown.tick(now_ms);
        let fire = if tick == CountdownTick::Expired {
            shared.cancel_cadence();
            shared.on_expire.take()
        } else {
            None
        };
        (tick, fire)
    };

    publish(remaining, tick.remaining_secs());
    if let Some(on_expire) = fire {
        tracing::debug!("expiry: window expired");
        on_expire();
    }
    Some(tick)
}

async fn run_cadence(
    shared: Arc<Mutex<TimerShared>>,
    remaining: Arc<watch::Sender<u64>>,
    clock: Arc<dyn Clock>,
    cadence: Duration,
    cancel: CancellationToken,
    generation: u64,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + cadence, cadence);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        match tick_shared(&shared, &remaining, clock.now_ms(), Some(generation)) {
            Some(tick) if tick.keeps_ticking() => {}
            _ => break,
        }
    }
}
