//! Failure-handling primitives: circuit breaking and retry backoff.
//!
//! This module provides:
//! - Circuit breaker with growing cooldown per re-opening
//! - Retry logic with exponential backoff and jitter
//! - An injectable breaker registry with an `execute` combinator

mod circuit_breaker;
mod registry;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use registry::BreakerRegistry;
pub use retry::{retry_async, OnRetry, RetryConfig};
