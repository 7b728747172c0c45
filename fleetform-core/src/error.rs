//! The reconciler's error taxonomy.
//!
//! Every variant names the resource and the operation that was attempted, so
//! that the orchestration layer can decide between retrying, aborting and
//! asking for manual intervention without parsing messages.

use std::{fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    id::{MalformedIdentifier, ResourceIdentifier},
    model::LifecycleState,
    remote::RemoteError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Read,
    Update,
    Replace,
    Delete,
    Import,
    Exists,
    Plan,
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Replace => "replace",
            Operation::Delete => "delete",
            Operation::Import => "import",
            Operation::Exists => "exists",
            Operation::Plan => "plan",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    #[error("{operation}: {source}")]
    MalformedIdentifier {
        operation: Operation,
        #[source]
        source: MalformedIdentifier,
    },

    /// The resource exists but is not managed by the caller; it has to be
    /// imported first.
    #[error("{operation} {id}: the resource already exists and needs to be imported to be managed")]
    AlreadyExists {
        id: ResourceIdentifier,
        operation: Operation,
    },

    #[error("{operation} {id}: the resource does not exist")]
    NotFound {
        id: ResourceIdentifier,
        operation: Operation,
    },

    #[error("{operation} {id}: parent {parent} is {parent_state}")]
    ParentNotReady {
        id: ResourceIdentifier,
        operation: Operation,
        parent: ResourceIdentifier,
        parent_state: LifecycleState,
    },

    /// Rejected by local validation or by the remote with a 4xx status.
    /// Never retried.
    #[error("{operation} {id}: invalid request: {message}")]
    InvalidRequest {
        id: ResourceIdentifier,
        operation: Operation,
        message: String,
    },

    #[error("{operation} {id}: giving up after {attempts} attempts")]
    TransientFailure {
        id: ResourceIdentifier,
        operation: Operation,
        attempts: u32,
        #[source]
        last_error: RemoteError,
    },

    /// The remote accepted the operation and later reported that it failed.
    #[error("{operation} {id}: the remote operation failed: {remote_error}")]
    OperationFailed {
        id: ResourceIdentifier,
        operation: Operation,
        /// The remote's error body, verbatim.
        remote_error: String,
    },

    #[error("{operation} {id}: the remote operation did not complete within {timeout:?}")]
    OperationTimeout {
        id: ResourceIdentifier,
        operation: Operation,
        timeout: Duration,
    },

    /// The remote version kept changing underneath us.
    #[error("{operation} {id}: conflicting concurrent modification: {message}")]
    Conflict {
        id: ResourceIdentifier,
        operation: Operation,
        message: String,
    },

    /// Cancelled by the caller. The remote operation may still be running.
    #[error("{operation} {id}: canceled")]
    Canceled {
        id: ResourceIdentifier,
        operation: Operation,
    },

    /// A replacement deleted the old resource but could not create the new
    /// one. The resource no longer exists. `operation` is always
    /// [`Operation::Replace`].
    #[error("{operation} {id}: the old resource was deleted, but creating its replacement failed")]
    ReplacementPartialFailure {
        id: ResourceIdentifier,
        operation: Operation,
        state: LifecycleState,
        #[source]
        source: Box<ReconcileError>,
    },

    /// A remote error that fits none of the other categories, such as an
    /// undecodable response.
    #[error("{operation} {id}: {source}")]
    Remote {
        id: ResourceIdentifier,
        operation: Operation,
        #[source]
        source: RemoteError,
    },
}

impl ReconcileError {
    pub fn invalid_request(
        id: &ResourceIdentifier,
        operation: Operation,
        message: impl Into<String>,
    ) -> Self {
        ReconcileError::InvalidRequest {
            id: id.clone(),
            operation,
            message: message.into(),
        }
    }

    pub fn not_found(id: &ResourceIdentifier, operation: Operation) -> Self {
        ReconcileError::NotFound {
            id: id.clone(),
            operation,
        }
    }

    pub fn canceled(id: &ResourceIdentifier, operation: Operation) -> Self {
        ReconcileError::Canceled {
            id: id.clone(),
            operation,
        }
    }

    /// Classify a remote error that was not (or no longer) retried.
    pub fn from_remote(
        id: &ResourceIdentifier,
        operation: Operation,
        attempts: u32,
        error: RemoteError,
    ) -> Self {
        let id = id.clone();
        match error {
            RemoteError::Client { status, body } => ReconcileError::InvalidRequest {
                id,
                operation,
                message: format!("{}: {}", status, body),
            },
            RemoteError::PreconditionFailed { body } => ReconcileError::Conflict {
                id,
                operation,
                message: body,
            },
            e if e.is_transient() => ReconcileError::TransientFailure {
                id,
                operation,
                attempts,
                last_error: e,
            },
            e => ReconcileError::Remote {
                id,
                operation,
                source: e,
            },
        }
    }

    /// The resource the error is about, when the identifier could be parsed.
    pub fn id(&self) -> Option<&ResourceIdentifier> {
        match self {
            ReconcileError::MalformedIdentifier { .. } => None,
            ReconcileError::AlreadyExists { id, .. }
            | ReconcileError::NotFound { id, .. }
            | ReconcileError::ParentNotReady { id, .. }
            | ReconcileError::InvalidRequest { id, .. }
            | ReconcileError::TransientFailure { id, .. }
            | ReconcileError::OperationFailed { id, .. }
            | ReconcileError::OperationTimeout { id, .. }
            | ReconcileError::Conflict { id, .. }
            | ReconcileError::Canceled { id, .. }
            | ReconcileError::ReplacementPartialFailure { id, .. }
            | ReconcileError::Remote { id, .. } => Some(id),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            ReconcileError::MalformedIdentifier { operation, .. }
            | ReconcileError::AlreadyExists { operation, .. }
            | ReconcileError::NotFound { operation, .. }
            | ReconcileError::ParentNotReady { operation, .. }
            | ReconcileError::InvalidRequest { operation, .. }
            | ReconcileError::TransientFailure { operation, .. }
            | ReconcileError::OperationFailed { operation, .. }
            | ReconcileError::OperationTimeout { operation, .. }
            | ReconcileError::Conflict { operation, .. }
            | ReconcileError::Canceled { operation, .. }
            | ReconcileError::ReplacementPartialFailure { operation, .. }
            | ReconcileError::Remote { operation, .. } => *operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ResourceIdentifier {
        "/subscriptions/s/resourceGroups/g/providers/Microsoft.ContainerRegistry/registries/acr1"
            .parse()
            .unwrap()
    }

    #[test]
    fn client_errors_are_invalid_requests() {
        let err = ReconcileError::from_remote(
            &id(),
            Operation::Create,
            1,
            RemoteError::Client {
                status: 400,
                body: "InvalidParameter".to_string(),
            },
        );
        assert!(matches!(err, ReconcileError::InvalidRequest { .. }));
        assert!(err.to_string().contains("InvalidParameter"));
        assert_eq!(err.operation(), Operation::Create);
        assert_eq!(err.id(), Some(&id()));
    }

    #[test]
    fn exhausted_transient_errors() {
        let err = ReconcileError::from_remote(
            &id(),
            Operation::Read,
            5,
            RemoteError::Server {
                status: 503,
                body: String::new(),
            },
        );
        match err {
            ReconcileError::TransientFailure { attempts, .. } => assert_eq!(attempts, 5),
            e => panic!("unexpected {:?}", e),
        }
    }

    #[test]
    fn precondition_failures_are_conflicts() {
        let err = ReconcileError::from_remote(
            &id(),
            Operation::Update,
            1,
            RemoteError::PreconditionFailed {
                body: "etag mismatch".to_string(),
            },
        );
        assert!(matches!(err, ReconcileError::Conflict { .. }));
    }

    #[test]
    fn partial_replacement_reports_the_inner_failure() {
        let inner = ReconcileError::OperationFailed {
            id: id(),
            operation: Operation::Create,
            remote_error: "QuotaExceeded".to_string(),
        };
        let err = ReconcileError::ReplacementPartialFailure {
            id: id(),
            operation: Operation::Replace,
            state: LifecycleState::Absent,
            source: Box::new(inner),
        };
        assert_eq!(err.operation(), Operation::Replace);
        assert!(err.to_string().starts_with("replace /subscriptions/s/"), "{}", err);
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("QuotaExceeded"));
    }
}
