//! Call-site retry with exponential backoff + jitter

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::PipelineError;

const MAX_BACKOFF_MS: u64 = 30_000;
const BACKOFF_JITTER_RATIO: f64 = 0.20;

/// Retry policy for collaborator calls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    /// Delay before retry number `attempt` (1-based), capped and jittered by ±20%
    pub fn backoff_with_jitter_ms(&self, attempt: u32) -> u64 {
        let capped_attempt = attempt.saturating_sub(1).min(16);
        let base = self.base_delay_ms.saturating_mul(1u64 << capped_attempt);
        let bounded = base.min(MAX_BACKOFF_MS);
        if bounded == 0 {
            return 0;
        }

        let unit: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let jitter = 1.0 + ((unit * 2.0) - 1.0) * BACKOFF_JITTER_RATIO;
        ((bounded as f64) * jitter)
            .round()
            .clamp(1.0, MAX_BACKOFF_MS as f64) as u64
    }

    /// Run `op` until it succeeds or attempts are exhausted
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_error = format!("{:#}", e);
                    if attempt < attempts {
                        let delay_ms = self.backoff_with_jitter_ms(attempt);
                        warn!(
                            operation,
                            attempt,
                            delay_ms,
                            error = %last_error,
                            "Retrying with exponential backoff + jitter"
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
            }
        }

        Err(PipelineError::UpstreamFailure {
            operation: operation.to_string(),
            attempts,
            reason: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_is_bounded() {
        let policy = RetryPolicy::new(5, 1000);
        let first = policy.backoff_with_jitter_ms(1);
        let later = policy.backoff_with_jitter_ms(30);
        assert!((800..=1200).contains(&first));
        assert!(later <= MAX_BACKOFF_MS);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, 0);
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = policy
            .run("flaky", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("temporary outage")
                }
                Ok(42)
            })
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_upstream_failure_when_exhausted() {
        let policy = RetryPolicy::new(2, 0);
        let result: Result<(), _> = policy
            .run("quote", || async { anyhow::bail!("feed down") })
            .await;
        match result {
            Err(PipelineError::UpstreamFailure {
                operation,
                attempts,
                reason,
            }) => {
                assert_eq!(operation, "quote");
                assert_eq!(attempts, 2);
                assert!(reason.contains("feed down"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
