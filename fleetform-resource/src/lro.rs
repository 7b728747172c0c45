//! Polling long-running operations to a terminal state.

use std::time::Duration;

use fleetform_core::{ObservedState, OperationHandle, OperationStatus, RemoteApi};
use tracing::debug;

use crate::retry::{retry_with_backoff, Backoff, RetryConfig, RetryFailure};

#[derive(Clone, Debug)]
pub struct PollConfig {
    /// Used when the remote doesn't suggest an interval.
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
            backoff_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Succeeded(Option<ObservedState>),
    /// The remote's error body.
    Failed(String),
    /// The remote canceled the operation.
    Canceled(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollError {
    Timeout(Duration),
    Remote(RetryFailure),
}

/// Poll `handle` until it reaches a terminal state or `timeout` passes.
///
/// Individual polls are retried according to `retry`. Dropping the returned
/// future stops polling; it does not stop the remote operation.
pub async fn poll_to_completion(
    client: &dyn RemoteApi,
    handle: &OperationHandle,
    config: &PollConfig,
    retry: &RetryConfig,
    timeout: Duration,
) -> Result<PollOutcome, PollError> {
    let polling = async {
        let mut backoff = Backoff::new(
            config.initial_interval,
            config.max_interval,
            config.backoff_multiplier,
        );
        let mut delay = handle.retry_after;
        let mut polls = 0u32;
        loop {
            tokio::time::sleep(delay.unwrap_or_else(|| backoff.next_delay())).await;
            polls += 1;
            let status = match retry_with_backoff(retry, "poll_operation", || {
                client.poll_operation(handle)
            })
            .await
            {
                Ok(status) => status,
                Err(failure) => return Err(PollError::Remote(failure)),
            };
            match status {
                OperationStatus::Running { retry_after } => {
                    debug!(id = %handle.id, operation = %handle.operation, polls, "operation still running");
                    delay = retry_after;
                }
                OperationStatus::Succeeded(observed) => return Ok(PollOutcome::Succeeded(observed)),
                OperationStatus::Failed(body) => return Ok(PollOutcome::Failed(body)),
                OperationStatus::Canceled(body) => return Ok(PollOutcome::Canceled(body)),
            }
        }
    };
    match tokio::time::timeout(timeout, polling).await {
        Ok(result) => result,
        Err(_) => Err(PollError::Timeout(timeout)),
    }
}
