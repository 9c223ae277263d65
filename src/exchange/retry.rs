//! Bounded retries for venue calls

use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::ExchangeError;
use crate::types::OrderResult;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay after every failed attempt
    Fixed(Duration),
    /// `base * attempt` after the n-th failed attempt
    Linear(Duration),
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_secs(1))
    }
}

impl Backoff {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Linear(base) => base.saturating_mul(attempt.max(1)),
        }
    }
}

/// Run `op` up to `max_attempts` times.
///
/// Only [`ExchangeError::is_retryable`] failures are retried. Fatal and
/// non-retryable errors return immediately so the retry budget is never
/// burned against a dead key.
pub async fn retry_with_backoff<T, F, Fut>(
    label: &str,
    max_attempts: u32,
    backoff: Backoff,
    mut op: F,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_fatal() => {
                error!(op = label, error = %e, "🛑 Fatal venue error, not retrying");
                return Err(e);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                warn!(op = label, attempts = attempt, error = %e, "Retry budget exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.delay(attempt);
                warn!(
                    op = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Venue call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Same as [`retry_with_backoff`] for calls returning [`OrderResult`]:
/// an unsuccessful result is retried when its error is retryable.
pub async fn retry_order<F, Fut>(
    label: &str,
    max_attempts: u32,
    backoff: Backoff,
    mut op: F,
) -> Result<OrderResult, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<OrderResult, ExchangeError>>,
{
    retry_with_backoff(label, max_attempts, backoff, || {
        let fut = op();
        async move { fut.await.and_then(OrderResult::into_result) }
    })
    .await
}
