//! Explicitly-owned registry of circuit breakers, keyed by operation.
//!
//! The registry is created at application start, injected into whoever
//! gates work through it (stream manager, error queue), and torn down with
//! the owner. Nothing in the crate reaches for an ambient global map.

use crate::error::{CoreError, Result};
use crate::resilience::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats,
};
use crate::resilience::retry::{retry_async, OnRetry, RetryConfig};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Registry of circuit breakers keyed by operation (a topic, an endpoint).
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    breaker_config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    /// Create a registry with default breaker configuration.
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a registry whose breakers share a custom configuration.
    pub fn with_config(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            breaker_config,
        }
    }

    /// Get or create the breaker for a key.
    pub async fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(cb) = breakers.get(key) {
                return Arc::clone(cb);
            }
        }

        let mut breakers = self.breakers.write().await;
        // Re-check: another task may have created it between the locks.
        if let Some(cb) = breakers.get(key) {
            return Arc::clone(cb);
        }
        debug!("Creating circuit breaker for key: {}", key);
        let cb = Arc::new(CircuitBreaker::with_config(
            key,
            self.breaker_config.clone(),
        ));
        breakers.insert(key.to_string(), Arc::clone(&cb));
        cb
    }

    /// Check whether the breaker for a key currently admits attempts.
    ///
    /// Read-only: unlike [`CircuitBreaker::allow_request`], this never
    /// consumes a half-open probe. Keys with no breaker yet are admitted.
    pub async fn is_admitting(&self, key: &str) -> bool {
        let breakers = self.breakers.read().await;
        breakers
            .get(key)
            .map(|cb| {
                !matches!(
                    cb.state(),
                    crate::resilience::circuit_breaker::CircuitState::Open
                )
            })
            .unwrap_or(true)
    }

    /// Run a fallible operation through the breaker for `key`.
    ///
    /// If the circuit is open and its cooldown has not elapsed, this fails
    /// immediately with [`CoreError::CircuitOpen`] and the operation is never
    /// invoked. Otherwise the operation runs under `retry` (exponential
    /// backoff with jitter); every attempt reports its outcome to the
    /// breaker, so the circuit can open mid-loop and cut the remaining
    /// attempts short. `on_retry` is a pure observer.
    pub async fn execute<F, Fut, T>(
        &self,
        key: &str,
        retry: &RetryConfig,
        mut operation: F,
        on_retry: Option<OnRetry<'_>>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker(key).await;
        let key = key.to_string();

        retry_async(
            retry,
            || {
                // Gate before constructing the attempt so a rejected attempt
                // does no work at all. In half-open this consumes the single
                // probe.
                let admitted = breaker.allow_request();
                let attempt = if admitted { Some(operation()) } else { None };
                let breaker = Arc::clone(&breaker);
                let key = key.clone();
                async move {
                    let Some(attempt) = attempt else {
                        return Err(CoreError::CircuitOpen { key });
                    };
                    match attempt.await {
                        Ok(value) => {
                            breaker.record_success();
                            Ok(value)
                        }
                        Err(e) => {
                            if e.is_retryable() {
                                breaker.record_failure();
                            }
                            Err(e)
                        }
                    }
                }
            },
            on_retry,
        )
        .await
    }

    /// Stats for every breaker in the registry.
    pub async fn stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers
            .read()
            .await
            .values()
            .map(|cb| cb.stats())
            .collect()
    }

    /// Reset the breaker for a key, if one exists.
    pub async fn reset(&self, key: &str) {
        if let Some(cb) = self.breakers.read().await.get(key) {
            cb.reset();
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
