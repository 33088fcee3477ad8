//! Bounded retry with linear backoff for upstream request steps.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{GatewayError, Result};

/// Where the retry loop waits between attempts. Swapped out in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Wait after the given (1-based) failed attempt: `base_delay * attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Anything carrying an HTTP status.
pub trait HasStatus {
    fn status_code(&self) -> u16;
}

impl HasStatus for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }
}

/// Run `send` until it yields a non-5xx response or attempts run out.
///
/// Only transient errors (see [`GatewayError::is_transient`]) and 5xx
/// responses are retried. Any other response, 4xx included, is returned
/// as-is for the caller to interpret; any other error propagates at once.
/// On exhaustion the last transient error is returned, or
/// [`GatewayError::RetriesExhausted`] if every failure was a 5xx.
pub async fn send_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    step: &str,
    mut send: F,
) -> Result<T>
where
    T: HasStatus,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<GatewayError> = None;

    for attempt in 1..=policy.max_attempts {
        match send().await {
            Ok(response) if response.status_code() < 500 => return Ok(response),
            Ok(response) => {
                tracing::warn!(
                    step,
                    attempt,
                    status = response.status_code(),
                    "Upstream server error, will retry"
                );
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(step, attempt, error = %e, "Upstream request failed, will retry");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }

        if attempt < policy.max_attempts {
            sleeper.sleep(policy.delay_after(attempt)).await;
        }
    }

    Err(last_error.unwrap_or(GatewayError::RetriesExhausted {
        attempts: policy.max_attempts,
    }))
}
