use std::future::Future;
use std::time::Duration;

use crate::gemini::AiError;

/// Bounded exponential backoff, applied only to rate-limit errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(2000),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            factor: 1,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        self.initial_delay
            .saturating_mul(self.factor.saturating_pow(exponent))
    }
}

/// Runs `call` until it succeeds, fails with something other than a rate
/// limit, or the attempts run out. The last error is returned unchanged.
pub async fn retry_on_rate_limit<T, F, Fut>(policy: RetryPolicy, mut call: F) -> Result<T, AiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AiError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_rate_limit() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::info!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "rate limit hit, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
