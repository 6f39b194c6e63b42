use crate::config::RetrySettings;
use crate::error::OrchestratorError;
use std::future::Future;

/// Bounded exponential backoff applied at the public operation boundary.
///
/// The whole operation is re-run; only `EngineUnavailable` is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff_ms: settings.initial_backoff_ms,
            max_backoff_ms: settings.max_backoff_ms,
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from the initial backoff.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        std::cmp::min(
            self.initial_backoff_ms.saturating_mul(factor),
            self.max_backoff_ms,
        )
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let backoff = self.backoff_ms(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        backoff_ms = backoff,
                        error = %err,
                        "Engine unavailable, retrying"
                    );
                    tokio::time::sleep(tokio::time::Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::error!(operation, attempts = attempt, error = %err, "Retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(&RetrySettings {
            max_attempts,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff_ms(1), 100);
        assert_eq!(p.backoff_ms(2), 200);
        assert_eq!(p.backoff_ms(3), 300);
        assert_eq!(p.backoff_ms(30), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run("ping", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(OrchestratorError::EngineUnavailable("down".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_unavailable() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(2)
            .run("ping", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OrchestratorError::EngineUnavailable("down".into()))
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::EngineUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(3)
            .run("ping", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OrchestratorError::Timeout {
                    operation: "ping".into(),
                    after_ms: 10,
                })
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
