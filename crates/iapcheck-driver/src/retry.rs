use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::info;

/// Exponential backoff bounded by total elapsed time.
///
/// The wait after attempt `n` (1-based) is `multiplier * 2^(n-1)`, clamped to
/// `[min_wait, max_wait]`. There is no attempt limit; the loop stops once
/// `deadline` has elapsed since the first attempt started. Sleeps are clipped
/// to the remaining budget, so a caller waits at most `deadline` plus the
/// duration of one attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub multiplier: Duration,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub deadline: Duration,
}

impl RetryPolicy {
    /// 1 s multiplier, waits clamped to 4–10 s.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            multiplier: Duration::from_secs(1),
            min_wait: Duration::from_secs(4),
            max_wait: Duration::from_secs(10),
            deadline,
        }
    }

    /// Wait applied after the given (1-based) failed attempt.
    pub fn wait_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.multiplier
            .saturating_mul(factor)
            .max(self.min_wait)
            .min(self.max_wait)
    }

    /// Run `op` until it succeeds, fails with an error `retryable` rejects,
    /// or the deadline passes. The last error is returned unchanged.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let start = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !retryable(&e) => return Err(e),
                Err(e) => e,
            };

            let elapsed = start.elapsed();
            info!(
                attempt,
                elapsed_secs = elapsed.as_secs_f64(),
                error = %err,
                "attempt failed"
            );
            if elapsed >= self.deadline {
                return Err(err);
            }
            let wait = self.wait_after(attempt).min(self.deadline - elapsed);
            sleep(wait).await;
        }
    }
}
