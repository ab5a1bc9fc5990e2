use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::BreakerError,
    models::circuit_breaker::{CircuitBreakerConfig, CircuitState, CircuitStats},
};

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<(Instant, DateTime<Utc>)>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.consecutive_successes = 0;
        self.opened_at = Some((Instant::now(), Utc::now()));
    }

    fn half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
    }
}

/// Process-local guard around calls to one named dependency.
///
/// The lock is only taken to read or update counters and is never held while
/// the guarded operation runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    reset_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(breaker = %name, "Circuit breaker initialized");

        Self {
            reset_timeout: Duration::from_secs(config.timeout_seconds),
            name,
            config,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;

        match operation().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Operation(e))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        let opened_at = inner.opened_at.map(|(_, at)| at);

        let next_attempt_at = match inner.state {
            CircuitState::Open => opened_at.and_then(|at| {
                chrono::Duration::from_std(self.reset_timeout)
                    .ok()
                    .map(|timeout| at + timeout)
            }),
            _ => None,
        };

        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            opened_at,
            next_attempt_at,
        }
    }

    /// Forces the breaker back to CLOSED with cleared counters.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::closed();
        info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.inner.lock();

        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = inner
            .opened_at
            .map(|(at, _)| at.elapsed())
            .unwrap_or_default();

        if elapsed >= self.reset_timeout {
            inner.half_open();
            info!(breaker = %self.name, "Circuit breaker attempting reset");
            return Ok(());
        }

        debug!(breaker = %self.name, "Circuit breaker is open, rejecting call");
        Err(BreakerError::Open(self.name.clone()))
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                debug!(
                    breaker = %self.name,
                    successes = inner.consecutive_successes,
                    threshold = self.config.success_threshold,
                    "Circuit breaker success recorded"
                );

                if inner.consecutive_successes >= self.config.success_threshold {
                    *inner = BreakerState::closed();
                    info!(breaker = %self.name, "Circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.open();
                warn!(breaker = %self.name, "Circuit breaker reopened after failed recovery attempt");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                debug!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker failure recorded"
                );

                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.open();
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            CircuitState::Open => inner.consecutive_failures += 1,
        }
    }
}

/// Breakers keyed by dependency name, shared by intake, workers and the API.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.value().clone())
    }

    pub fn all_stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<CircuitStats> = self
            .breakers
            .iter()
            .map(|entry| entry.value().stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}
