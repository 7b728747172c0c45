//! Resource lifecycle reconciliation against a remote control plane.
//!
//! A [`ReconcilerFactory`] hands out one [`Reconciler`] per resource. The
//! reconciler plans with the [`diff`](diff::diff) of a resource type's
//! [`ResourceSchema`], and writes through a [`RemoteApi`](fleetform_core::RemoteApi)
//! implementation.

pub mod catalog;
pub mod diff;
pub mod importer;
pub mod lock;
pub mod lro;
pub mod payload;
pub mod probe;
pub mod reconciler;
pub mod retry;
pub mod schema;

pub use importer::{Imported, Importer};
pub use lock::LockTable;
pub use lro::{PollConfig, PollError, PollOutcome};
pub use probe::Probe;
pub use reconciler::{ReconcilePolicy, Reconciler, ReconcilerFactory};
pub use retry::{RetryConfig, RetryFailure};
pub use schema::{FieldKind, FieldSchema, Mutability, ResourceSchema, Timeouts};
