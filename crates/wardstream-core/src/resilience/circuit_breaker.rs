//! Circuit breaker guarding a single operation key.
//!
//! States:
//! - CLOSED: normal operation, attempts flow through
//! - OPEN: failing, attempts are rejected immediately
//! - HALF_OPEN: cooldown elapsed, exactly one probe allowed
//!
//! Unlike a fixed-timeout breaker, the cooldown grows with each re-opening:
//! `cooldown = min(base * 2^(openings - 1), max)`. A successful probe resets
//! both the consecutive failure count and the opening count.

use crate::config::BreakerConfig;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - attempts flow through.
    Closed,
    /// Failing - attempts are rejected immediately.
    Open,
    /// Testing recovery - a single probe is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Cooldown after the first opening.
    pub base_cooldown: Duration,
    /// Cooldown growth cap.
    pub max_cooldown: Duration,
    /// Probes permitted in half-open state.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: BreakerConfig::FAILURE_THRESHOLD,
            base_cooldown: BreakerConfig::BASE_COOLDOWN,
            max_cooldown: BreakerConfig::MAX_COOLDOWN,
            half_open_max_probes: BreakerConfig::HALF_OPEN_MAX_PROBES,
        }
    }
}

/// Circuit breaker for one operation key (a topic, or an endpoint class).
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    /// Current state of the circuit.
    state: RwLock<CircuitState>,
    /// Consecutive failure count (reset on success).
    consecutive_failures: AtomicU32,
    /// How many times this circuit has been opened since the last close.
    openings: AtomicU32,
    /// Lifetime totals, for the stats surface.
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    /// When the circuit was opened.
    opened_at: RwLock<Option<Instant>>,
    /// Probes issued in the current half-open window.
    half_open_probes: AtomicU32,
    /// Operation key this breaker protects.
    key: String,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration.
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_config(key, CircuitBreakerConfig::default())
    }

    /// Create a new circuit breaker with custom configuration.
    pub fn with_config(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            openings: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            opened_at: RwLock::new(None),
            half_open_probes: AtomicU32::new(0),
            key: key.into(),
        }
    }

    /// Get the current state of the circuit.
    pub fn state(&self) -> CircuitState {
        self.maybe_transition_to_half_open();
        *self.state.read().unwrap()
    }

    /// The cooldown currently in force, derived from the opening count.
    pub fn current_cooldown(&self) -> Duration {
        let openings = self.openings.load(Ordering::SeqCst).max(1);
        let factor = 2u32.saturating_pow(openings - 1);
        self.config
            .base_cooldown
            .saturating_mul(factor)
            .min(self.config.max_cooldown)
    }

    /// Check if an attempt should be allowed through.
    ///
    /// In half-open state this consumes the probe budget, so callers must
    /// follow a `true` result with exactly one attempt and then report the
    /// outcome via [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn allow_request(&self) -> bool {
        self.maybe_transition_to_half_open();

        let state = *self.state.read().unwrap();
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let probes = self.half_open_probes.fetch_add(1, Ordering::SeqCst);
                probes < self.config.half_open_max_probes
            }
        }
    }

    /// Record a successful attempt.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);

        let state = *self.state.read().unwrap();
        if state == CircuitState::HalfOpen {
            // Probe succeeded - close the circuit and forget past openings.
            self.transition_to_closed();
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::SeqCst);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        let state = *self.state.read().unwrap();
        match state {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed - reopen with a larger cooldown.
                self.transition_to_open();
            }
            CircuitState::Open => {}
        }
    }

    /// Get statistics about this circuit breaker.
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            key: self.key.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            openings: self.openings.load(Ordering::SeqCst),
            total_failures: self.total_failures.load(Ordering::SeqCst),
            total_successes: self.total_successes.load(Ordering::SeqCst),
            current_cooldown: self.current_cooldown(),
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.openings.store(0, Ordering::SeqCst);
        self.half_open_probes.store(0, Ordering::SeqCst);
        *self.opened_at.write().unwrap() = None;
        *self.state.write().unwrap() = CircuitState::Closed;
        info!("Circuit breaker for {} reset to CLOSED", self.key);
    }

    // Internal state transitions

    fn transition_to_open(&self) {
        let mut state = self.state.write().unwrap();
        if *state != CircuitState::Open {
            *state = CircuitState::Open;
            self.openings.fetch_add(1, Ordering::SeqCst);
            *self.opened_at.write().unwrap() = Some(Instant::now());
            self.half_open_probes.store(0, Ordering::SeqCst);
            warn!(
                "Circuit breaker for {} opened (opening #{}, cooldown {:?})",
                self.key,
                self.openings.load(Ordering::SeqCst),
                self.current_cooldown()
            );
        }
    }

    fn transition_to_half_open(&self) {
        let mut state = self.state.write().unwrap();
        if *state == CircuitState::Open {
            *state = CircuitState::HalfOpen;
            self.half_open_probes.store(0, Ordering::SeqCst);
            debug!("Circuit breaker for {} entering HALF_OPEN", self.key);
        }
    }

    fn transition_to_closed(&self) {
        let mut state = self.state.write().unwrap();
        *state = CircuitState::Closed;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.openings.store(0, Ordering::SeqCst);
        *self.opened_at.write().unwrap() = None;
        info!("Circuit breaker for {} recovered to CLOSED", self.key);
    }

    fn maybe_transition_to_half_open(&self) {
        let state = *self.state.read().unwrap();
        if state != CircuitState::Open {
            return;
        }

        let opened_at = *self.opened_at.read().unwrap();
        if let Some(opened) = opened_at {
            if opened.elapsed() >= self.current_cooldown() {
                self.transition_to_half_open();
            }
        }
    }
}

/// Statistics about a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub openings: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub current_cooldown: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            base_cooldown: Duration::from_millis(10),
            max_cooldown: Duration::from_millis(80),
            half_open_max_probes: 1,
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("ward-1");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let cb = CircuitBreaker::with_config("ward-1", fast_config());

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::with_config("ward-1", fast_config());

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        // Only 2 consecutive failures since the success
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_single_probe_in_half_open() {
        let cb = CircuitBreaker::with_config("ward-1", fast_config());

        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Exactly one probe is permitted
        assert!(cb.allow_request());
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_probe_success_closes_and_resets() {
        let cb = CircuitBreaker::with_config("ward-1", fast_config());

        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
        assert_eq!(cb.stats().openings, 0);
    }

    #[test]
    fn test_probe_failure_reopens_with_larger_cooldown() {
        let cb = CircuitBreaker::with_config("ward-1", fast_config());

        for _ in 0..3 {
            cb.record_failure();
        }
        let first_cooldown = cb.current_cooldown();
        assert_eq!(first_cooldown, Duration::from_millis(10));

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.current_cooldown(), Duration::from_millis(20));
    }

    #[test]
    fn test_cooldown_capped() {
        let cb = CircuitBreaker::with_config("ward-1", fast_config());

        // Force many openings; cooldown must stop growing at the cap.
        for _ in 0..10 {
            cb.openings.fetch_add(1, Ordering::SeqCst);
        }
        assert_eq!(cb.current_cooldown(), Duration::from_millis(80));
    }

    #[test]
    fn test_reset() {
        let cb = CircuitBreaker::with_config("ward-1", fast_config());

        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }
}
