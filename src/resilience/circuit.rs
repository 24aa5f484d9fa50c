//! Per-key circuit breaker.
//!
//! State machine: closed → open once the failure counter reaches the
//! threshold; open → half-open on the first `can_execute` after the timeout
//! elapses; half-open → closed after enough consecutive successes (failure
//! counter reset) or back to open on any failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_successes: u32,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    metrics: CircuitBreakerMetrics,
    opened_at: Option<Instant>,
}

/// One breaker, keyed by task type at the layer above.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                metrics: CircuitBreakerMetrics::default(),
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.inner.lock().unwrap().metrics.clone()
    }

    /// Gate one request. In the open state this transitions to half-open
    /// once the cooldown has elapsed; before that it short-circuits.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.timeout)
                    .unwrap_or(true);
                if elapsed {
                    tracing::debug!("Circuit {} transitioning to half-open", self.name);
                    inner.state = CircuitState::HalfOpen;
                    inner.metrics.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.metrics.total_requests += 1;
        inner.metrics.successful_requests += 1;
        inner.metrics.last_success = Some(Utc::now());
        inner.metrics.consecutive_successes += 1;

        if inner.state == CircuitState::HalfOpen
            && inner.metrics.consecutive_successes >= self.config.success_threshold
        {
            tracing::info!("Circuit {} closed", self.name);
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.metrics.failed_requests = 0;
        }
    }

    /// Record a failure. Returns true when this call opened the circuit.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.metrics.total_requests += 1;
        inner.metrics.failed_requests += 1;
        inner.metrics.last_failure = Some(Utc::now());
        inner.metrics.consecutive_successes = 0;

        let opened = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                inner.metrics.failed_requests >= u64::from(self.config.failure_threshold)
            }
            CircuitState::Open => false,
        };
        if opened {
            tracing::warn!(
                "Circuit {} opened after {} failure(s)",
                self.name,
                inner.metrics.failed_requests
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
        opened
    }

    /// Force the breaker closed and zero its counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.metrics = CircuitBreakerMetrics::default();
    }
}
