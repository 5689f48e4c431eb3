//! Per-Endpoint Circuit Breaker
//!
//! Four-state breaker guarding each registered endpoint. Failures are
//! counted consecutively; a single success closes the circuit again. When
//! open, the first probe after the recovery timeout is let through in a
//! half-open (degraded) state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Endpoint health and breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Healthy,
    /// Elevated errors or latency; also the half-open probe state
    Degraded,
    /// Error rate past the unhealthy threshold
    Unhealthy,
    /// Breaker tripped; requests are rejected
    CircuitOpen,
}

impl CircuitState {
    /// Check if requests should be allowed
    #[must_use]
    pub const fn allows_requests(&self) -> bool {
        !matches!(self, Self::CircuitOpen)
    }

    /// State name as used in reports
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time the circuit stays open before a half-open probe
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Breaker counters, shared with reports
#[derive(Debug, Default)]
pub struct CircuitBreakerStats {
    /// Circuit open events
    pub open_events: AtomicU64,
    /// Half-open probe events
    pub probe_events: AtomicU64,
    /// Requests rejected while open
    pub rejected_requests: AtomicU64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker guarding one endpoint.
///
/// Shared between the request path and the health loop, so all methods take
/// `&self` and state lives behind a mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    stats: CircuitBreakerStats,
}

impl CircuitBreaker {
    /// Create new circuit breaker
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Healthy,
                failure_count: 0,
                last_failure: None,
            }),
            stats: CircuitBreakerStats::default(),
        }
    }

    /// Check whether a request may proceed.
    ///
    /// An open circuit whose recovery timeout has elapsed transitions to
    /// degraded and admits this one probe request.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::CircuitOpen {
            return true;
        }

        let recovered = inner
            .last_failure
            .is_some_and(|at| at.elapsed() > self.config.recovery_timeout);
        if recovered {
            inner.state = CircuitState::Degraded;
            self.stats.probe_events.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.stats.rejected_requests.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Record a successful request; closes the circuit
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.state = CircuitState::Healthy;
    }

    /// Record a failed request; opens the circuit past the threshold
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        if inner.failure_count >= self.config.failure_threshold
            && inner.state != CircuitState::CircuitOpen
        {
            inner.state = CircuitState::CircuitOpen;
            self.stats.open_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Administrative reset to healthy
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Healthy;
        inner.failure_count = 0;
        inner.last_failure = None;
    }

    /// Overwrite the health classification. The health loop uses this; an
    /// open circuit is never downgraded here, only `reset` or a successful
    /// probe closes it.
    pub fn set_health(&self, state: CircuitState) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::CircuitOpen {
            inner.state = state;
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Current consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Breaker counters
    #[must_use]
    pub const fn stats(&self) -> &CircuitBreakerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic, clippy::float_cmp)]

    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
        })
    }

    #[test]
    fn test_starts_healthy() {
        let b = breaker(3, 100);
        assert_eq!(b.state(), CircuitState::Healthy);
        assert!(b.can_execute());
    }

    #[test]
    fn test_circuit_opening() {
        let b = breaker(3, 100);

        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Healthy);
        assert!(b.can_execute());

        b.record_failure();
        assert_eq!(b.state(), CircuitState::CircuitOpen);
        assert!(!b.can_execute());
        assert_eq!(b.stats().rejected_requests.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_success_resets_failures() {
        let b = breaker(3, 100);

        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.failure_count(), 0);

        // Needs a full run of threshold failures again
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Healthy);
    }

    #[test]
    fn test_half_open_probe_after_recovery() {
        let b = breaker(1, 20);

        b.record_failure();
        assert_eq!(b.state(), CircuitState::CircuitOpen);
        assert!(!b.can_execute());

        std::thread::sleep(Duration::from_millis(30));
        assert!(b.can_execute());
        assert_eq!(b.state(), CircuitState::Degraded);

        // Probe succeeds, circuit closes
        b.record_success();
        assert_eq!(b.state(), CircuitState::Healthy);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let b = breaker(1, 20);

        b.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(b.can_execute());

        b.record_failure();
        assert_eq!(b.state(), CircuitState::CircuitOpen);
        assert!(!b.can_execute());
    }

    #[test]
    fn test_administrative_reset() {
        let b = breaker(1, 10_000);

        b.record_failure();
        assert!(!b.can_execute());

        b.reset();
        assert_eq!(b.state(), CircuitState::Healthy);
        assert!(b.can_execute());
    }

    #[test]
    fn test_health_override_never_closes_open_circuit() {
        let b = breaker(1, 10_000);

        b.set_health(CircuitState::Degraded);
        assert_eq!(b.state(), CircuitState::Degraded);

        b.record_failure();
        b.set_health(CircuitState::Healthy);
        assert_eq!(b.state(), CircuitState::CircuitOpen);
    }
}
