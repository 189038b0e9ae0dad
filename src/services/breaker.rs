//! Process-wide circuit breaker for backend calls
//!
//! Tracks consecutive remote-call failures. Opens after a threshold to stop
//! hammering a failing backend, half-opens after a cool-down to allow exactly
//! one probing call, and closes again on any success.
//!
//! Pure state transitions; the caller supplies `now` so tests never sleep.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Consecutive failures before the breaker opens
pub const FAILURE_THRESHOLD: u32 = 5;

/// How long the breaker stays open before allowing a probe
pub const COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    failure_threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            failure_threshold,
            cooldown,
            opened_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// True while the breaker is not fully closed. The booking cache uses
    /// this to decide whether stale entries may still be served.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.state != BreakerState::Closed
    }

    /// Record a successful remote call: resets the failure count and closes
    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            info!(
                failures = %self.consecutive_failures,
                "breaker_closed"
            );
        }
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// Record a failed remote call.
    ///
    /// A failure while half-open reopens immediately and restarts the
    /// cool-down clock.
    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
                warn!("breaker_reopened_after_probe");
            }
            BreakerState::Open => {
                // Already open; nothing to count
            }
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                    warn!(
                        failures = %self.consecutive_failures,
                        cooldown_secs = %self.cooldown.as_secs(),
                        "breaker_opened"
                    );
                }
            }
        }
    }

    /// Whether a remote call may be attempted right now.
    ///
    /// Closed: always. Open: only once the cool-down has elapsed, which moves
    /// the breaker to half-open and grants exactly one probing call. Half-open:
    /// the probe has already been granted, so no.
    pub fn can_attempt(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = self.opened_at.map(|t| now.duration_since(t));
                if elapsed.is_some_and(|e| e >= self.cooldown) {
                    self.state = BreakerState::HalfOpen;
                    debug!("breaker_half_open");
                    true
                } else {
                    false
                }
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, COOLDOWN)
    }
}
