//! The Remote Client Facade: the only way the reconciler talks to a control plane.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    id::ResourceIdentifier,
    model::{ObservedState, OperationHandle, OperationStatus, Submitted, WriteRequest},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RemoteError {
    /// The request did not produce a response: connection, DNS, timeout.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("throttled by the remote API")]
    Throttled { retry_after: Option<Duration> },

    #[error("remote API returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("remote API rejected the request with {status}: {body}")]
    Client { status: u16, body: String },

    /// `If-Match` did not match the remote's current version.
    #[error("precondition failed: {body}")]
    PreconditionFailed { body: String },

    #[error("could not decode the remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether retrying the same request may succeed: transport errors,
    /// 408, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Transport(_) | RemoteError::Throttled { .. } => true,
            RemoteError::Server { .. } => true,
            RemoteError::Client { status, .. } => *status == 408,
            RemoteError::PreconditionFailed { .. } | RemoteError::Decode(_) => false,
        }
    }

    /// The delay the remote asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// CRUD plus long-running-operation polling against one control plane.
///
/// Implementations must be safe to share between reconcilers of different
/// resources; calls for different identifiers are independent.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// `Ok(None)` when the resource does not exist.
    async fn get(&self, id: &ResourceIdentifier) -> Result<Option<ObservedState>, RemoteError>;

    async fn create_or_update(
        &self,
        id: &ResourceIdentifier,
        request: &WriteRequest,
    ) -> Result<Submitted<ObservedState>, RemoteError>;

    /// Deleting a resource that does not exist completes with `Done(())`.
    async fn delete(&self, id: &ResourceIdentifier) -> Result<Submitted<()>, RemoteError>;

    async fn poll_operation(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationStatus, RemoteError>;
}
