//! Exponential backoff for transient upstream failures.
//!
//! Only errors whose kind is transient (`rate_limited`,
//! `source_unavailable`, `model_unavailable`) are retried. Everything
//! else is returned on the first attempt.

use std::future::Future;
use std::time::Duration;

use deepwiki_core::Result;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Backoff {
    pub fn from_config(config: &RetryConfig, max_retries: u32) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            max_retries,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            max_retries: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2×base,
    /// 4×base, ... capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }
}

/// Run `op`, retrying transient failures with exponential backoff.
pub async fn with_backoff<T, F, Fut>(what: &str, backoff: &Backoff, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < backoff.max_retries => {
                attempt += 1;
                let delay = backoff.delay(attempt);
                tracing::warn!(
                    operation = what,
                    error = %err,
                    attempt,
                    max_retries = backoff.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use deepwiki_core::{Error, ErrorKind};

    use super::*;

    fn fast(max_retries: u32) -> Backoff {
        Backoff {
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
            max_retries,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let b = Backoff::from_config(
            &RetryConfig {
                base_delay_ms: 1000,
                max_delay_ms: 32_000,
            },
            10,
        );
        assert_eq!(b.delay(1), Duration::from_secs(1));
        assert_eq!(b.delay(2), Duration::from_secs(2));
        assert_eq!(b.delay(4), Duration::from_secs(8));
        assert_eq!(b.delay(9), Duration::from_secs(32));
        assert_eq!(b.delay(40), Duration::from_secs(32));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let out = with_backoff("test", &fast(3), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::RateLimited("slow down".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let err = with_backoff("test", &fast(2), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::ModelUnavailable("down".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn structural_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_backoff("test", &fast(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::NotFound("acme/none".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
