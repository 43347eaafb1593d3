//! Per-exchange circuit breaker for the watch loops.
//!
//! Tracks a rolling error count inside a time window. When the count
//! crosses the threshold the breaker opens and every watch loop for that
//! venue pauses for a cool-down, instead of hammering a degraded venue
//! with reconnects. After the cool-down one probe round is allowed
//! (half-open); its outcome closes or re-opens the breaker.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, calls allowed
    Closed,
    /// Tripped, calls blocked until the cool-down passes
    Open,
    /// Cool-down passed; probing whether the venue recovered
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Errors inside the window that trip the breaker
    pub error_threshold: u32,
    /// Rolling window for counting errors
    pub window: Duration,
    /// How long the breaker stays open after tripping
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 10,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    errors: VecDeque<Instant>,
    tripped_at: Option<Instant>,
}

/// Circuit breaker for one exchange.
pub struct ExchangeBreaker {
    exchange_id: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    trips: AtomicU64,
}

impl ExchangeBreaker {
    pub fn new(exchange_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                errors: VecDeque::new(),
                tripped_at: None,
            }),
            trips: AtomicU64::new(0),
        }
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn trip_count(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Whether calls to this venue are currently allowed. An open breaker
    /// transitions to half-open once the cool-down has passed.
    pub fn is_available(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled = inner
                    .tripped_at
                    .map(|t| t.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    info!(exchange = %self.exchange_id, "circuit breaker half-open, probing venue");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Time left until an open breaker allows a probe.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Open => inner
                .tripped_at
                .map(|t| self.config.cooldown.saturating_sub(t.elapsed())),
            _ => None,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            info!(exchange = %self.exchange_id, "circuit breaker closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.errors.clear();
        inner.tripped_at = None;
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::HalfOpen => {
                // The probe failed; straight back to open
                inner.state = BreakerState::Open;
                inner.tripped_at = Some(now);
                self.trips.fetch_add(1, Ordering::Relaxed);
                warn!(exchange = %self.exchange_id, "circuit breaker re-opened during probe");
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                inner.errors.push_back(now);
                while let Some(front) = inner.errors.front() {
                    if now.duration_since(*front) > self.config.window {
                        inner.errors.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.errors.len() as u32 >= self.config.error_threshold {
                    inner.state = BreakerState::Open;
                    inner.tripped_at = Some(now);
                    inner.errors.clear();
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        exchange = %self.exchange_id,
                        threshold = self.config.error_threshold,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "circuit breaker OPENED"
                    );
                }
            }
        }
    }
}
