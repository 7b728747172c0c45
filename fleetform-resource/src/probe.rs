//! The Existence Probe, for verification harnesses.
//!
//! Reconcilers never use it: they need the observation, not just its presence.

use std::sync::Arc;

use fleetform_core::{Operation, ReconcileError, RemoteApi, ResourceIdentifier};
use tracing::debug;

use crate::{
    reconciler::ReconcilerFactory,
    retry::{retry_with_backoff, RetryConfig},
};

pub struct Probe {
    client: Arc<dyn RemoteApi>,
    retry: RetryConfig,
}

impl ReconcilerFactory {
    pub fn probe(&self) -> Probe {
        Probe {
            client: self.client(),
            retry: self.policy().retry.clone(),
        }
    }
}

impl Probe {
    /// Whether the remote reports the resource. Errors other than "not found"
    /// propagate.
    pub async fn exists(&self, id: &ResourceIdentifier) -> Result<bool, ReconcileError> {
        let client = self.client.clone();
        let observed = retry_with_backoff(&self.retry, "get", || client.get(id))
            .await
            .map_err(|f| ReconcileError::from_remote(id, Operation::Exists, f.attempts, f.error))?;
        debug!(id = %id, exists = observed.is_some(), "probed");
        Ok(observed.is_some())
    }

    pub async fn exists_raw(&self, raw: &str) -> Result<bool, ReconcileError> {
        let id: ResourceIdentifier =
            raw.parse()
                .map_err(|source| ReconcileError::MalformedIdentifier {
                    operation: Operation::Exists,
                    source,
                })?;
        self.exists(&id).await
    }
}
