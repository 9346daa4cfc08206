//! Completion service seam
//!
//! The engine only knows [`CompletionService`]. Concrete backends live in the
//! providers crate; [`ResilientCompletion`] adds the retry, backoff and hard
//! timeout every call site relies on.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use crate::config::CompletionSettings;
use crate::error::CompletionError;

/// Text produced by a completion backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub provider: String,
    pub content: String,
    pub tokens: u32,
}

impl Completion {
    pub fn new(provider: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            content: content.into(),
            tokens: 0,
        }
    }
}

#[async_trait]
pub trait CompletionService: Send + Sync + std::fmt::Debug {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, CompletionError>;
}

/// Backend that always fails; runs the engine on fallback rules only
#[derive(Debug, Clone, Default)]
pub struct UnavailableCompletion;

#[async_trait]
impl CompletionService for UnavailableCompletion {
    async fn complete(&self, _system: &str, _user: &str) -> Result<Completion, CompletionError> {
        Err(CompletionError::Unavailable(
            "no completion provider configured".to_string(),
        ))
    }
}

/// Statistics for completion calls
#[derive(Debug, Clone, Default)]
pub struct CompletionStats {
    pub total_requests: u32,
    pub successful_requests: u32,
    pub failed_requests: u32,
    pub retry_count: u32,
    pub timeouts: u32,
    pub total_tokens: u64,
    pub avg_response_time_ms: f64,
}

/// Retrying, time-bounded wrapper around a backend
#[derive(Debug, Clone)]
pub struct ResilientCompletion {
    inner: Arc<dyn CompletionService>,
    settings: CompletionSettings,
    stats: Arc<Mutex<CompletionStats>>,
}

impl ResilientCompletion {
    pub fn new(inner: Arc<dyn CompletionService>, settings: CompletionSettings) -> Self {
        Self {
            inner,
            settings,
            stats: Arc::new(Mutex::new(CompletionStats::default())),
        }
    }

    pub fn unavailable() -> Self {
        Self::new(Arc::new(UnavailableCompletion), CompletionSettings::default())
    }

    pub fn settings(&self) -> &CompletionSettings {
        &self.settings
    }

    /// Call the backend with per-attempt timeout and exponential backoff
    pub async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, CompletionError> {
        let start = Instant::now();
        let max_attempts = self.settings.max_retries.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let outcome = tokio::time::timeout(
                self.settings.timeout(),
                self.inner.complete(system_prompt, user_prompt),
            )
            .await;

            let error = match outcome {
                Ok(Ok(completion)) => {
                    let mut stats = self.stats.lock();
                    stats.total_requests += 1;
                    stats.successful_requests += 1;
                    stats.total_tokens += completion.tokens as u64;
                    let elapsed = start.elapsed().as_millis() as f64;
                    stats.avg_response_time_ms = (stats.avg_response_time_ms
                        * (stats.successful_requests - 1) as f64
                        + elapsed)
                        / stats.successful_requests as f64;
                    return Ok(completion);
                }
                Ok(Err(e)) => e,
                Err(_) => {
                    self.stats.lock().timeouts += 1;
                    CompletionError::Timeout(self.settings.timeout())
                }
            };

            // Unavailable and open-circuit errors are not retried
            let terminal = matches!(
                error,
                CompletionError::Unavailable(_) | CompletionError::CircuitOpen(_)
            );

            if attempts >= max_attempts || terminal {
                let mut stats = self.stats.lock();
                stats.total_requests += 1;
                stats.failed_requests += 1;
                drop(stats);
                tracing::warn!(
                    "Completion failed after {} attempt(s): {}",
                    attempts,
                    error
                );
                return Err(CompletionError::Exhausted {
                    attempts,
                    last: error.to_string(),
                });
            }

            self.stats.lock().retry_count += 1;
            let backoff = self.settings.backoff(attempts);
            tracing::warn!(
                "Completion failed (attempt {}/{}), retrying in {:?}: {}",
                attempts,
                max_attempts,
                backoff,
                error
            );
            tokio::time::sleep(backoff).await;
        }
    }

    pub fn stats(&self) -> CompletionStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = CompletionStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct Flaky {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CompletionService for Flaky {
        async fn complete(&self, _s: &str, _u: &str) -> Result<Completion, CompletionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(CompletionError::Provider("503".to_string()))
            } else {
                Ok(Completion::new("flaky", "ok"))
            }
        }
    }

    #[derive(Debug)]
    struct Hanging;

    #[async_trait]
    impl CompletionService for Hanging {
        async fn complete(&self, _s: &str, _u: &str) -> Result<Completion, CompletionError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Completion::new("hanging", "never"))
        }
    }

    fn fast_settings(max_retries: u32) -> CompletionSettings {
        CompletionSettings {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let inner = Arc::new(Flaky {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
        });
        let client = ResilientCompletion::new(inner.clone(), fast_settings(3));

        let result = client.complete("sys", "user").await.unwrap();
        assert_eq!(result.content, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);

        let stats = client.stats();
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.retry_count, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let inner = Arc::new(Flaky {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
        });
        let client = ResilientCompletion::new(inner.clone(), fast_settings(2));

        let err = client.complete("sys", "user").await.unwrap_err();
        assert!(matches!(err, CompletionError::Exhausted { attempts: 2, .. }));
        assert_eq!(client.stats().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_hard_timeout() {
        let client = ResilientCompletion::new(Arc::new(Hanging), fast_settings(2));
        let err = client.complete("sys", "user").await.unwrap_err();
        assert!(matches!(err, CompletionError::Exhausted { attempts: 2, .. }));
        assert_eq!(client.stats().timeouts, 2);
    }

    #[tokio::test]
    async fn test_unavailable_is_not_retried() {
        let client = ResilientCompletion::unavailable();
        let err = client.complete("sys", "user").await.unwrap_err();
        assert!(matches!(err, CompletionError::Exhausted { attempts: 1, .. }));
    }
}
