//! Circuit breaker guarding the storage backend
//!
//! ```text
//!            failures >= threshold
//!   CLOSED ─────────────────────────▶ OPEN
//!     ▲                                │ cooldown elapsed
//!     │ probe ok                       ▼
//!     └────────────────────────── HALF_OPEN ──probe failed──▶ OPEN
//! ```
//!
//! OPEN turns into HALF_OPEN lazily, the first time `allow()` or `state()`
//! is called after the cooldown. HALF_OPEN lets exactly one probe through.
//!
//! Callers that may be cancelled mid-call take a [`CallPermit`] instead of
//! pairing `allow()` with `record_outcome()` by hand: a permit dropped
//! before completion counts as a failure, which frees the probe slot.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent OPEN before a probe is allowed
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without reaching the backend
    Open,
    /// One probe call is allowed to test recovery
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding used by the state gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Point-in-time breaker statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: BreakerState,
    /// Consecutive failures counted in CLOSED
    pub consecutive_failures: u32,
    /// Configured threshold
    pub failure_threshold: u32,
    /// Times the breaker went to OPEN
    pub total_trips: u64,
    /// Calls rejected while OPEN or while a probe was in flight
    pub rejected_calls: u64,
    /// Remaining cooldown when OPEN
    pub cooldown_remaining: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    total_trips: u64,
    rejected_calls: u64,
}

/// Circuit breaker; one instance per backend connection
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                total_trips: 0,
                rejected_calls: 0,
            }),
        }
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask permission for one call
    ///
    /// In HALF_OPEN the first caller gets the probe slot; everyone else is
    /// rejected until the probe outcome is recorded.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);

        let allowed = match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    debug!(breaker = %self.name, "Probe call admitted");
                    true
                }
            }
        };
        if !allowed {
            inner.rejected_calls += 1;
        }
        allowed
    }

    /// Ask permission for one call and get a permit that reports its outcome
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        self.allow().then(|| CallPermit {
            breaker: self,
            settled: false,
        })
    }

    /// Report the outcome of an allowed call
    pub fn record_outcome(&self, success: bool) {
        let mut inner = self.inner.lock();
        match (inner.state, success) {
            (BreakerState::Closed, true) => {
                inner.consecutive_failures = 0;
            }
            (BreakerState::Closed, false) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opened"
                    );
                    self.trip(&mut inner);
                }
            }
            (BreakerState::HalfOpen, true) => {
                info!(breaker = %self.name, "Probe succeeded, circuit breaker closed");
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
            }
            (BreakerState::HalfOpen, false) => {
                warn!(breaker = %self.name, "Probe failed, circuit breaker reopened");
                self.trip(&mut inner);
            }
            (BreakerState::Open, _) => {
                // Outcome of a call allowed before the breaker opened
                debug!(breaker = %self.name, success, "Outcome recorded while open");
            }
        }
    }

    /// Current state, applying the lazy OPEN -> HALF_OPEN transition
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Statistics snapshot
    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        let cooldown_remaining = match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(at)) => {
                Some(self.config.cooldown.saturating_sub(at.elapsed()))
            }
            _ => None,
        };
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            total_trips: inner.total_trips,
            rejected_calls: inner.rejected_calls,
            cooldown_remaining,
        }
    }

    /// Force the breaker closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probe_in_flight = false;
        inner.total_trips += 1;
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state != BreakerState::Open {
            return;
        }
        let cooled = inner
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.cooldown);
        if cooled {
            info!(breaker = %self.name, "Cooldown elapsed, circuit breaker half-open");
            inner.state = BreakerState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }
}

/// One admitted call, settled exactly once
#[must_use = "dropping a permit records a failure"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl CallPermit<'_> {
    /// Report how the call went
    pub fn complete(mut self, success: bool) {
        self.settled = true;
        self.breaker.record_outcome(success);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(breaker = %self.breaker.name, "Call abandoned before completion");
            self.breaker.record_outcome(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "influxdb",
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(30),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_exactly_at_threshold() {
        let cb = breaker(5);
        for _ in 0..4 {
            assert!(cb.allow());
            cb.record_outcome(false);
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        assert!(cb.allow());
        cb.record_outcome(false);
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow());
        assert_eq!(cb.stats().total_trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let cb = breaker(3);
        cb.record_outcome(false);
        cb.record_outcome(false);
        cb.record_outcome(true);
        cb.record_outcome(false);
        cb.record_outcome(false);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_single_probe() {
        let cb = breaker(1);
        cb.record_outcome(false);
        assert!(!cb.allow());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.allow());
        assert!(!cb.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let cb = breaker(2);
        cb.record_outcome(false);
        cb.record_outcome(false);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(cb.allow());
        cb.record_outcome(true);
        let stats = cb.stats();
        assert_eq!(stats.state, BreakerState::Closed);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_restarts_cooldown() {
        let cb = breaker(1);
        cb.record_outcome(false);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(cb.allow());
        cb.record_outcome(false);
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.stats().total_trips, 2);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cb.state(), BreakerState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cb = breaker(1);
        cb.record_outcome(false);
        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_call_frees_half_open_slot() {
        let cb = breaker(1);
        cb.record_outcome(false);
        tokio::time::advance(Duration::from_secs(30)).await;

        let permit = cb.try_acquire().unwrap();
        assert!(cb.try_acquire().is_none());
        drop(permit);
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        let permit = cb.try_acquire().unwrap();
        permit.complete(true);
        assert_eq!(cb.state(), BreakerState::Closed);
    }
}
