//! Circuit breaker in front of each completion backend
//!
//! A provider that keeps failing is skipped for a recovery period instead of
//! costing every turn a full retry cycle.

use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use taxintake_core::CompletionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through
    Closed,
    /// Requests fail fast until the recovery timeout elapses
    Open,
    /// A limited number of probe requests decide whether to close again
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    /// Successes in half-open needed to close
    pub success_threshold: u32,
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_requests: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_requests: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider_name: String,
    config: CircuitBreakerConfig,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider_name: provider_name.into(),
            config,
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_requests: 0,
                last_failure: None,
            }),
        }
    }

    /// Admit or reject a request, moving Open to HalfOpen once recovered
    pub async fn can_execute(&self) -> Result<(), CompletionError> {
        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map(|last| last.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);

                if recovered {
                    tracing::info!(
                        "Circuit breaker for {} transitioning to half-open",
                        self.provider_name
                    );
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.half_open_requests = 1;
                    Ok(())
                } else {
                    Err(CompletionError::CircuitOpen(self.provider_name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_requests < self.config.half_open_max_requests {
                    inner.half_open_requests += 1;
                    Ok(())
                } else {
                    Err(CompletionError::CircuitOpen(self.provider_name.clone()))
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                // let the next probe through
                inner.half_open_requests = inner.half_open_requests.saturating_sub(1);
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(
                        "Circuit breaker for {} closed - provider recovered",
                        self.provider_name
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            CircuitState::Closed | CircuitState::Open => {
                inner.failure_count = 0;
            }
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        "Circuit breaker for {} opened after {} failures",
                        self.provider_name,
                        inner.failure_count
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    "Circuit breaker for {} back to OPEN - recovery failed",
                    self.provider_name
                );
                inner.state = CircuitState::Open;
                inner.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.read().await;
        CircuitBreakerMetrics {
            provider: self.provider_name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure: inner.last_failure,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub provider: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure: Option<Instant>,
}
