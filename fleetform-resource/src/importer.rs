//! The Drift Importer: desired state reconstructed from what the remote
//! reports.

use std::sync::Arc;

use fleetform_core::{
    DesiredState, ObservedState, Operation, Properties, ReconcileError, RemoteApi,
    ResourceIdentifier,
};
use serde_json::Value;
use tracing::{info, info_span, Instrument};

use crate::{
    catalog,
    reconciler::ReconcilerFactory,
    retry::{retry_with_backoff, RetryConfig},
    schema::{FieldKind, FieldSchema, ResourceSchema},
};

/// The result of an import.
#[derive(Debug, Clone)]
pub struct Imported {
    pub schema: &'static ResourceSchema,
    pub id: ResourceIdentifier,
    /// Every field the schema knows, as observed. Computed fields are
    /// included for display; they are dropped again when the state is used
    /// for a write.
    pub desired: DesiredState,
    pub observed: ObservedState,
}

pub struct Importer {
    client: Arc<dyn RemoteApi>,
    retry: RetryConfig,
}

impl ReconcilerFactory {
    pub fn importer(&self) -> Importer {
        Importer {
            client: self.client(),
            retry: self.policy().retry.clone(),
        }
    }
}

impl Importer {
    pub async fn import(
        &self,
        schema: &'static ResourceSchema,
        id: &ResourceIdentifier,
    ) -> Result<Imported, ReconcileError> {
        let client = self.client.clone();
        let observed = retry_with_backoff(&self.retry, "get", || client.get(id))
            .instrument(info_span!("import", id = %id))
            .await
            .map_err(|f| ReconcileError::from_remote(id, Operation::Import, f.attempts, f.error))?
            .ok_or_else(|| ReconcileError::not_found(id, Operation::Import))?;
        info!(id = %id, type_name = schema.type_name, "imported");
        Ok(Imported {
            schema,
            id: id.clone(),
            desired: DesiredState::new(project(schema.fields, &observed.properties)),
            observed,
        })
    }

    /// Import from a raw identifier, working out the resource type from it.
    pub async fn import_raw(&self, raw: &str) -> Result<Imported, ReconcileError> {
        let id: ResourceIdentifier =
            raw.parse()
                .map_err(|source| ReconcileError::MalformedIdentifier {
                    operation: Operation::Import,
                    source,
                })?;
        let schema = catalog::for_id(&id).ok_or_else(|| {
            ReconcileError::invalid_request(
                &id,
                Operation::Import,
                format!("unsupported resource type {}", id.type_path()),
            )
        })?;
        // Canonical casing, and a check of the segment count.
        let id = schema
            .id_template
            .parse(raw)
            .map_err(|source| ReconcileError::MalformedIdentifier {
                operation: Operation::Import,
                source,
            })?;
        self.import(schema, &id).await
    }
}

/// The observed properties the schema knows about, minus write-only fields.
fn project(fields: &[FieldSchema], observed: &Properties) -> Properties {
    let mut out = Properties::new();
    for field in fields {
        if field.write_only {
            continue;
        }
        let value = match observed.get(field.name) {
            None | Some(Value::Null) => continue,
            Some(v) => v,
        };
        let value = match (field.kind, value) {
            (FieldKind::Block(children), Value::Object(block)) => {
                Value::Object(project(children, block))
            }
            (_, v) => v.clone(),
        };
        out.insert(field.name.to_string(), value);
    }
    out
}
