use std::{fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{id::ResourceIdentifier, Operation};

/// Resource properties, keyed by their remote JSON names.
pub type Properties = serde_json::Map<String, Value>;

/// What the caller declared.
///
/// Explicit presence matters: a property that is missing means "not
/// managed / remove", while a property set to `null` means "explicitly
/// cleared".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    pub properties: Properties,
}

impl DesiredState {
    pub fn new(properties: Properties) -> Self {
        DesiredState { properties }
    }
}

impl From<Value> for DesiredState {
    /// Non-object values produce an empty state.
    fn from(value: Value) -> Self {
        match value {
            Value::Object(properties) => DesiredState { properties },
            _ => DesiredState::default(),
        }
    }
}

/// The spelling of a region the control plane reports: `West Europe` and
/// `westeurope` name the same location.
pub fn normalize_location(location: &str) -> String {
    location
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// The last snapshot fetched from the remote system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Nothing trustworthy is known, e.g. after a cancelled operation.
    Unknown,
    Absent,
    Creating,
    Present,
    Updating,
    Deleting,
    Failed,
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Unknown => "unknown",
            LifecycleState::Absent => "absent",
            LifecycleState::Creating => "creating",
            LifecycleState::Present => "present",
            LifecycleState::Updating => "updating",
            LifecycleState::Deleting => "deleting",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationState::Running)
    }
}

/// An asynchronous remote operation that was accepted but has not completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationHandle {
    pub id: ResourceIdentifier,
    pub operation: Operation,
    /// Where to ask for the operation's status. Opaque to everything but the
    /// facade that produced it.
    pub status_url: String,
    /// Poll interval suggested by the remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

/// The outcome of one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    Running { retry_after: Option<Duration> },
    /// Some remotes return the final resource with the terminal status.
    Succeeded(Option<ObservedState>),
    /// The remote's error body, verbatim.
    Failed(String),
    Canceled(String),
}

impl OperationStatus {
    pub fn state(&self) -> OperationState {
        match self {
            OperationStatus::Running { .. } => OperationState::Running,
            OperationStatus::Succeeded(_) => OperationState::Succeeded,
            OperationStatus::Failed(_) => OperationState::Failed,
            OperationStatus::Canceled(_) => OperationState::Canceled,
        }
    }
}

/// A mutating call either completed synchronously or was accepted as a
/// long-running operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Submitted<T> {
    Done(T),
    Accepted(OperationHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// The body replaces the whole resource.
    Put,
    /// The body is a JSON merge patch (RFC 7386).
    Patch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub mode: WriteMode,
    pub body: Properties,
    /// Optimistic concurrency: only apply the write if the remote version matches.
    pub if_match: Option<String>,
}

/// A JSON-pointer-like path into the properties, e.g. `upgradeSettings/maxSurge`
/// or `nodeLabels/environment`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(pub Vec<String>);

impl FieldPath {
    pub fn root() -> Self {
        FieldPath(Vec::new())
    }
    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        FieldPath(segments)
    }
    /// RFC 6901 rendering, usable with [`serde_json::Value::pointer`].
    pub fn to_pointer(&self) -> String {
        self.0
            .iter()
            .map(|s| format!("/{}", s.replace('~', "~0").replace('/', "~1")))
            .collect()
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum PlanAction {
    Set { value: Value },
    Unset,
    /// The change cannot be applied in place.
    Replace {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedChange {
    pub path: FieldPath,
    #[serde(flatten)]
    pub action: PlanAction,
}

/// The changes needed to bring the remote in line with the desired state,
/// in field order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationPlan {
    pub changes: Vec<PlannedChange>,
    pub requires_replace: bool,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn push(&mut self, path: FieldPath, action: PlanAction) {
        if matches!(action, PlanAction::Replace { .. }) {
            self.requires_replace = true;
        }
        self.changes.push(PlannedChange { path, action });
    }
}
