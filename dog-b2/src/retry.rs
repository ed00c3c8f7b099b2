use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::{B2Error, B2Result, RetryPolicy};

impl RetryPolicy {
    /// Capped exponential delay after `failures` failed attempts
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let factor = 2_u32.saturating_pow(exponent);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Backoff with equal jitter: half fixed, half random
    pub fn jittered_backoff(&self, failures: u32) -> Duration {
        let delay = self.backoff(failures);
        let half = delay / 2;
        let spread = half.as_millis() as u64;
        if spread == 0 {
            return delay;
        }
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    pub(crate) async fn pause(&self, failures: u32) {
        let delay = self.jittered_backoff(failures);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt ceiling is hit.
    ///
    /// Only transient errors are retried. Exhaustion wraps the last error.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> B2Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = B2Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    warn!(operation, attempt, error = %err, "transient failure, backing off");
                    self.pause(attempt).await;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    return Err(B2Error::RetryExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}
