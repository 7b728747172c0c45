//! Retrying remote calls with exponential backoff and jitter.
//!
//! Only transient errors (see [`RemoteError::is_transient`]) are retried. A
//! throttled response's `Retry-After` takes precedence over the computed
//! delay.

use std::{future::Future, time::Duration};

use fleetform_core::RemoteError;
use rand::Rng;
use tracing::{error, warn};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one (0 = infinite)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_delay, self.max_delay, self.backoff_multiplier)
    }

    /// Whether another attempt may follow attempt number `attempt`.
    pub fn allows_another(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

/// Exponentially growing delays, each jittered to 0.5x-1.5x, capped at a maximum.
#[derive(Clone, Debug)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Backoff {
            delay: initial,
            max_delay,
            multiplier,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);
        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64()),
        );
        jittered.min(self.max_delay)
    }
}

/// The last error of a call that was not retried (any further).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: RemoteError,
}

/// Run `operation` until it succeeds, fails permanently or runs out of attempts.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0u32;
    let mut backoff = config.backoff();

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => {
                return Err(RetryFailure {
                    attempts: attempt,
                    error: e,
                })
            }
            Err(e) => {
                if !config.allows_another(attempt) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Remote call failed after max retries"
                    );
                    return Err(RetryFailure {
                        attempts: attempt,
                        error: e,
                    });
                }

                let delay = match e.retry_after() {
                    Some(retry_after) => {
                        backoff.next_delay();
                        retry_after
                    }
                    None => backoff.next_delay(),
                };

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Remote call failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
