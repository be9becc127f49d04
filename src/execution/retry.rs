use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use crate::error::Error;

/// Bounded retries with exponential backoff and seeded jitter.
///
/// Delay for attempt n is `min(base * 2^(n-1), max_delay)` plus up to 10%
/// jitter. The last error surfaces after exhaustion.
pub struct RetryHandler {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    rng: Mutex<StdRng>,
}

impl RetryHandler {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, seed: u64) -> Self {
        RetryHandler {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn with_defaults(seed: u64) -> Self {
        RetryHandler::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(2),
            seed,
        )
    }

    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut last_error: Option<Error> = None;
        for attempt in 1..=self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "retryable operation failed");
                    last_error = Some(err);
                    if attempt >= self.max_attempts {
                        break;
                    }
                    let exp = self
                        .base_delay
                        .saturating_mul(2_u32.saturating_pow(attempt - 1))
                        .min(self.max_delay);
                    let jitter = if exp.is_zero() {
                        Duration::ZERO
                    } else {
                        let fraction: f64 = self.rng.lock().await.random_range(0.0..0.1);
                        exp.mul_f64(fraction)
                    };
                    tokio::time::sleep(exp + jitter).await;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Internal("retry failed without error".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_handler(max_attempts: u32) -> RetryHandler {
        RetryHandler::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(4),
            7,
        )
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let handler = fast_handler(3);
        let result: Result<i32, Error> = handler.run(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let handler = fast_handler(3);
        let calls = AtomicU32::new(0);
        let result = handler
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Transient("boom".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_last_error_after_exhaustion() {
        let handler = fast_handler(2);
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = handler
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Transient("always".into())) }
            })
            .await;
        assert!(matches!(result, Err(Error::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
