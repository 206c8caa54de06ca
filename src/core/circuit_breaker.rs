//! Circuit breaker: per-operation failure tracking with CLOSED/OPEN/HALF_OPEN
//! transitions, plus a process-wide registry keyed by `"<provider>-<operation>"`.

use crate::utils::error::{GatewayError, Result};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerMetrics {
    pub state: Option<CircuitState>,
    pub failures: u32,
    pub successes: u32,
    pub fallback_calls: u32,
    pub last_failure: Option<Instant>,
    pub last_success: Option<Instant>,
}

struct Inner {
    state: Mutex<CircuitState>,
    next_attempt: Mutex<Option<Instant>>,
    last_failure: Mutex<Option<Instant>>,
    last_success: Mutex<Option<Instant>>,
}

/// A named, process-wide breaker wrapping upstream calls for one
/// `<provider>-<operation>` pair.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Inner,
    failures: AtomicU32,
    successes: AtomicU32,
    fallback_calls: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Inner {
                state: Mutex::new(CircuitState::Closed),
                next_attempt: Mutex::new(None),
                last_failure: Mutex::new(None),
                last_success: Mutex::new(None),
            },
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            fallback_calls: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        *self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            state: Some(self.state()),
            failures: self.failures.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            fallback_calls: self.fallback_calls.load(Ordering::Relaxed),
            last_failure: *self.inner.last_failure.lock().unwrap_or_else(|p| p.into_inner()),
            last_success: *self.inner.last_success.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }

    /// Execute `action` under breaker protection. `fallback`, if provided,
    /// is invoked in place of failing fast while OPEN.
    pub async fn call<F, Fut, T, FB>(&self, action: F, fallback: Option<FB>) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(&GatewayError) -> Result<T>,
    {
        let mut state = *self.inner.state.lock().unwrap_or_else(|p| p.into_inner());

        if state == CircuitState::Open {
            let next_attempt = *self
                .inner
                .next_attempt
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let ready = next_attempt.map(|t| Instant::now() >= t).unwrap_or(true);
            if ready {
                debug!(breaker = %self.name, "transitioning OPEN -> HALF_OPEN");
                *self.inner.state.lock().unwrap_or_else(|p| p.into_inner()) =
                    CircuitState::HalfOpen;
                state = CircuitState::HalfOpen;
            } else {
                let open_err = GatewayError::CircuitOpen(self.name.clone());
                if let Some(fallback) = fallback {
                    self.fallback_calls.fetch_add(1, Ordering::Relaxed);
                    return fallback(&open_err);
                }
                return Err(open_err);
            }
        }

        match action().await {
            Ok(value) => {
                self.on_success(state);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(state);
                Err(err)
            }
        }
    }

    fn on_success(&self, prior_state: CircuitState) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        *self.inner.last_success.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
        if prior_state == CircuitState::HalfOpen {
            debug!(breaker = %self.name, "transitioning HALF_OPEN -> CLOSED");
            *self.inner.state.lock().unwrap_or_else(|p| p.into_inner()) = CircuitState::Closed;
            self.failures.store(0, Ordering::Relaxed);
        }
    }

    fn on_failure(&self, prior_state: CircuitState) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        *self.inner.last_failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());

        if prior_state == CircuitState::HalfOpen {
            warn!(breaker = %self.name, "transitioning HALF_OPEN -> OPEN (probe failed)");
            self.open();
            return;
        }

        if failures >= self.config.failure_threshold {
            warn!(breaker = %self.name, failures, "transitioning CLOSED -> OPEN");
            self.open();
        }
    }

    fn open(&self) {
        *self.inner.state.lock().unwrap_or_else(|p| p.into_inner()) = CircuitState::Open;
        *self
            .inner
            .next_attempt
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(Instant::now() + self.config.reset_timeout);
    }

    pub fn reset(&self) {
        *self.inner.state.lock().unwrap_or_else(|p| p.into_inner()) = CircuitState::Closed;
        self.failures.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        *self
            .inner
            .next_attempt
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = None;
    }
}

/// Process-wide registry of named breakers, keyed by `"<provider>-<operation>"`.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }
}

pub static BREAKERS: Lazy<CircuitBreakerRegistry> = Lazy::new(CircuitBreakerRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(threshold: u32, reset_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
        }
    }

    async fn ok() -> Result<&'static str> {
        Ok("ok")
    }
    async fn fail() -> Result<&'static str> {
        Err(GatewayError::Provider("boom".to_string()))
    }

    fn no_fallback() -> Option<fn(&GatewayError) -> Result<&'static str>> {
        None
    }

    #[tokio::test]
    async fn starts_closed() {
        let cb = CircuitBreaker::new("p-op", cfg(3, 1000));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("p-op", cfg(3, 30_000));
        for _ in 0..3 {
            let _ = cb.call(fail, no_fallback()).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_rejects_without_invoking_action() {
        let cb = CircuitBreaker::new("p-op", cfg(1, 30_000));
        let _ = cb.call(fail, no_fallback()).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb.call(ok, no_fallback()).await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn half_open_success_closes() {
        let cb = CircuitBreaker::new("p-op", cfg(1, 10));
        let _ = cb.call(fail, no_fallback()).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let result = cb.call(ok, no_fallback()).await;
        assert!(result.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new("p-op", cfg(1, 10));
        let _ = cb.call(fail, no_fallback()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let _ = cb.call(fail, no_fallback()).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn fallback_is_invoked_when_open() {
        let cb = CircuitBreaker::new("p-op", cfg(1, 30_000));
        let _ = cb.call(fail, no_fallback()).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb
            .call(ok, Some(|_: &GatewayError| -> Result<&'static str> { Ok("fallback") }))
            .await;
        assert_eq!(result.unwrap(), "fallback");
    }

    #[tokio::test]
    async fn action_error_is_propagated_unchanged_not_wrapped() {
        async fn not_found() -> Result<&'static str> {
            Err(GatewayError::NotFound("missing".to_string()))
        }
        let cb = CircuitBreaker::new("p-op", cfg(5, 30_000));
        let result = cb.call(not_found, no_fallback()).await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
    }

    #[test]
    fn registry_enumerates_breakers() {
        let registry = CircuitBreakerRegistry::new();
        registry.get_or_create("openai-completion", CircuitBreakerConfig::default());
        registry.get_or_create("anthropic-completion", CircuitBreakerConfig::default());
        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["anthropic-completion", "openai-completion"]);
    }

    #[test]
    fn registry_returns_same_instance() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get_or_create("openai-completion", CircuitBreakerConfig::default());
        let b = registry.get_or_create("openai-completion", CircuitBreakerConfig::default());
        assert!(Arc::ptr_eq(&a, &b));
    }
}
