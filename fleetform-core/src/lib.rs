//! Interfaces shared by the fleetform crates.
//!
//! The reconciler in `fleetform-resource` only ever talks to a control plane
//! through [`remote::RemoteApi`], and only ever names resources through
//! [`id::ResourceIdentifier`]. Keeping both here lets the control plane
//! implementations (`fleetform-remote-http`, `fleetform-resources-memory`)
//! depend on the interface without depending on the reconciler.

pub mod error;
pub mod id;
pub mod model;
pub mod remote;

pub use error::{Operation, ReconcileError};
pub use id::{IdTemplate, MalformedIdentifier, ResourceIdentifier, Segment};
pub use model::{
    normalize_location, DesiredState, FieldPath, LifecycleState, ObservedState, OperationHandle,
    OperationState, OperationStatus, PlanAction, PlannedChange, Properties, ReconciliationPlan,
    Submitted, WriteMode, WriteRequest,
};
pub use remote::{RemoteApi, RemoteError};
