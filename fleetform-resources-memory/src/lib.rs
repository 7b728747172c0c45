//! An in-memory control plane.
//!
//! [`MemoryControlPlane`] implements [`RemoteApi`] the way the real control
//! plane behaves, as far as the reconciler can tell:
//!
//! - writes may complete synchronously or be accepted as long-running
//!   operations that take a configurable number of polls,
//! - every write bumps the resource's ETag, and `If-Match` is honored,
//! - PUT replaces the stored body, PATCH merges into it (RFC 7386),
//! - computed and defaulted fields are filled in per resource type,
//! - locations are stored in their canonical spelling (`westeurope`),
//! - write-only fields are accepted but never returned,
//! - nested resources cannot be created under a missing parent,
//! - faults can be scripted per call kind.
//!
//! Unless disabled with [`PlaneConfig::record_calls`], every call is
//! recorded, so that tests can assert on the exact sequence of remote calls a
//! reconciler issued.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use fleetform_core::{
    normalize_location, ObservedState, Operation, OperationHandle, OperationStatus, Properties, RemoteApi, RemoteError,
    ResourceIdentifier, Submitted, WriteMode, WriteRequest,
};
use serde_json::Value;
use tracing::debug;

const OPERATION_URL_PREFIX: &str = "memory://operations/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Get,
    Put,
    Patch,
    Delete,
    Poll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: CallKind,
    pub id: ResourceIdentifier,
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        matches!(self.kind, CallKind::Put | CallKind::Patch | CallKind::Delete)
    }
}

/// A scripted misbehavior, consumed by the next call of its kind.
#[derive(Debug, Clone)]
pub enum Fault {
    /// The call fails with this error without any effect.
    Error(RemoteError),
    /// The write or delete is accepted, and its operation fails with this
    /// body. With `leave_resource`, a create leaves a resource behind in the
    /// `Failed` provisioning state.
    OperationFails {
        body: String,
        leave_resource: bool,
    },
    /// A `Get` reports the resource as absent even though it exists,
    /// as a lagging replica would.
    StaleRead,
    /// Someone else modifies the resource right before this call, changing
    /// its ETag.
    ConcurrentModification,
}

/// How a resource type behaves on the simulated control plane.
#[derive(Debug, Clone, Default)]
pub struct TypeBehavior {
    /// Set on every write, overriding the request. String values may refer
    /// to the resource name as `{name}`.
    pub computed: Properties,
    /// Set on writes that don't provide a value.
    pub defaults: Properties,
    /// JSON pointers of fields that are stored but never returned.
    pub write_only: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PlaneConfig {
    /// How many polls an accepted operation reports `Running` before it
    /// completes. Zero makes all writes and deletes synchronous.
    pub operation_polls: u32,
    /// The poll interval suggested to callers.
    pub retry_after: Option<Duration>,
    /// Whether nested resources need their parent to exist.
    pub require_parents: bool,
    /// Whether [`MemoryControlPlane::calls`] keeps a log. Long-running
    /// simulations turn it off.
    pub record_calls: bool,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        PlaneConfig {
            operation_polls: 2,
            retry_after: Some(Duration::from_secs(1)),
            require_parents: true,
            record_calls: true,
        }
    }
}

#[derive(Debug, Clone)]
struct Stored {
    properties: Properties,
    etag: String,
}

#[derive(Debug, Clone)]
enum Effect {
    Write { body: Properties, mode: WriteMode },
    Delete,
}

#[derive(Debug, Clone)]
struct PendingOperation {
    id: ResourceIdentifier,
    effect: Effect,
    remaining_polls: u32,
    failure: Option<(String, bool)>,
}

#[derive(Default)]
struct Inner {
    resources: HashMap<ResourceIdentifier, Stored>,
    next_etag: u64,
    operations: HashMap<String, PendingOperation>,
    next_operation: u64,
    faults: VecDeque<(CallKind, Fault)>,
    calls: Vec<Call>,
}

impl Inner {
    fn take_fault(&mut self, kind: CallKind) -> Option<Fault> {
        let index = self.faults.iter().position(|(k, _)| *k == kind)?;
        self.faults.remove(index).map(|(_, f)| f)
    }

    fn bump_etag(&mut self) -> String {
        self.next_etag += 1;
        format!("W/\"{}\"", self.next_etag)
    }

    fn touch(&mut self, id: &ResourceIdentifier) {
        let etag = self.bump_etag();
        if let Some(stored) = self.resources.get_mut(id) {
            stored.etag = etag;
        }
    }
}

pub struct MemoryControlPlane {
    config: PlaneConfig,
    behaviors: HashMap<String, TypeBehavior>,
    inner: Mutex<Inner>,
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        MemoryControlPlane::new(PlaneConfig::default())
    }
}

impl MemoryControlPlane {
    pub fn new(config: PlaneConfig) -> Self {
        MemoryControlPlane {
            config,
            behaviors: HashMap::new(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Writes and deletes complete without an operation handle.
    pub fn synchronous() -> Self {
        MemoryControlPlane::new(PlaneConfig {
            operation_polls: 0,
            ..PlaneConfig::default()
        })
    }

    /// Configure the behavior of a resource type, by its type path
    /// (e.g. `Microsoft.ContainerService/managedClusters/agentPools`).
    pub fn with_type(mut self, type_path: &str, behavior: TypeBehavior) -> Self {
        self.behaviors
            .insert(type_path.to_ascii_lowercase(), behavior);
        self
    }

    /// Queue a fault for the next call of `kind`.
    pub fn fail_next(&self, kind: CallKind, fault: Fault) {
        self.inner.lock().unwrap().faults.push_back((kind, fault));
    }

    /// Store a resource directly, as if it had been created by someone else.
    pub fn insert(&self, id: &ResourceIdentifier, properties: Properties) {
        let mut inner = self.inner.lock().unwrap();
        let etag = inner.bump_etag();
        let properties = self.complete(id, properties);
        inner
            .resources
            .insert(id.clone(), Stored { properties, etag });
    }

    /// Change a stored resource out of band, as drift would.
    pub fn modify(&self, id: &ResourceIdentifier, f: impl FnOnce(&mut Properties)) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let etag = inner.bump_etag();
        match inner.resources.get_mut(id) {
            Some(stored) => {
                f(&mut stored.properties);
                stored.etag = etag;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &ResourceIdentifier) -> bool {
        self.inner.lock().unwrap().resources.remove(id).is_some()
    }

    /// The stored properties, including write-only fields.
    pub fn stored(&self, id: &ResourceIdentifier) -> Option<Properties> {
        self.inner
            .lock()
            .unwrap()
            .resources
            .get(id)
            .map(|s| s.properties.clone())
    }

    pub fn contains(&self, id: &ResourceIdentifier) -> bool {
        self.inner.lock().unwrap().resources.contains_key(id)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.calls().iter().filter(|c| c.is_mutation()).count()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    fn behavior(&self, id: &ResourceIdentifier) -> Option<&TypeBehavior> {
        self.behaviors.get(&id.type_path().to_ascii_lowercase())
    }

    /// Apply defaults and computed fields, and respell the location.
    fn complete(&self, id: &ResourceIdentifier, mut properties: Properties) -> Properties {
        if let Some(Value::String(location)) = properties.get_mut("location") {
            *location = normalize_location(location);
        }
        if let Some(behavior) = self.behavior(id) {
            for (k, v) in &behavior.defaults {
                properties
                    .entry(k.clone())
                    .or_insert_with(|| v.clone());
            }
            for (k, v) in &behavior.computed {
                properties.insert(k.clone(), substitute_name(v, &id.name));
            }
        }
        properties
    }

    fn observe(&self, id: &ResourceIdentifier, stored: &Stored) -> ObservedState {
        let mut value = Value::Object(stored.properties.clone());
        if let Some(behavior) = self.behavior(id) {
            for pointer in &behavior.write_only {
                remove_pointer(&mut value, pointer);
            }
        }
        let properties = match value {
            Value::Object(properties) => properties,
            _ => Properties::new(),
        };
        ObservedState {
            properties,
            etag: Some(stored.etag.clone()),
        }
    }

    fn record(&self, inner: &mut Inner, kind: CallKind, id: &ResourceIdentifier) {
        debug!(?kind, id = %id, "memory control plane call");
        if self.config.record_calls {
            inner.calls.push(Call {
                kind,
                id: id.clone(),
            });
        }
    }

    fn apply(&self, inner: &mut Inner, id: &ResourceIdentifier, effect: &Effect) -> Option<Stored> {
        match effect {
            Effect::Write { body, mode } => {
                let properties = match (mode, inner.resources.get(id)) {
                    (WriteMode::Patch, Some(existing)) => {
                        let mut merged = Value::Object(existing.properties.clone());
                        json_patch::merge(&mut merged, &Value::Object(body.clone()));
                        match merged {
                            Value::Object(m) => m,
                            _ => Properties::new(),
                        }
                    }
                    _ => strip_nulls(body.clone()),
                };
                let properties = self.complete(id, properties);
                let etag = inner.bump_etag();
                let stored = Stored { properties, etag };
                inner.resources.insert(id.clone(), stored.clone());
                Some(stored)
            }
            Effect::Delete => {
                inner.resources.remove(id);
                inner
                    .resources
                    .retain(|child, _| !child.is_within(id));
                None
            }
        }
    }

    fn accept(
        &self,
        inner: &mut Inner,
        id: &ResourceIdentifier,
        operation: Operation,
        effect: Effect,
        failure: Option<(String, bool)>,
    ) -> OperationHandle {
        inner.next_operation += 1;
        let status_url = format!("{}{}", OPERATION_URL_PREFIX, inner.next_operation);
        inner.operations.insert(
            status_url.clone(),
            PendingOperation {
                id: id.clone(),
                effect,
                remaining_polls: self.config.operation_polls,
                failure,
            },
        );
        OperationHandle {
            id: id.clone(),
            operation,
            status_url,
            retry_after: self.config.retry_after,
        }
    }

    fn check_write(
        &self,
        inner: &Inner,
        id: &ResourceIdentifier,
        request: &WriteRequest,
    ) -> Result<(), RemoteError> {
        let existing = inner.resources.get(id);
        if let (Some(expected), Some(existing)) = (&request.if_match, existing) {
            if expected != &existing.etag {
                return Err(RemoteError::PreconditionFailed {
                    body: format!(
                        "{{\"code\":\"PreconditionFailed\",\"message\":\"ETag {} does not match {}\"}}",
                        expected, existing.etag
                    ),
                });
            }
        }
        if request.mode == WriteMode::Patch && existing.is_none() {
            return Err(not_found(id, "ResourceNotFound"));
        }
        if self.config.require_parents {
            if let Some(parent) = id.parent() {
                if !inner.resources.contains_key(&parent) {
                    return Err(not_found(&parent, "ParentResourceNotFound"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for MemoryControlPlane {
    async fn get(&self, id: &ResourceIdentifier) -> Result<Option<ObservedState>, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        self.record(&mut inner, CallKind::Get, id);
        match inner.take_fault(CallKind::Get) {
            Some(Fault::Error(e)) => return Err(e),
            Some(Fault::StaleRead) => return Ok(None),
            Some(Fault::ConcurrentModification) => inner.touch(id),
            Some(Fault::OperationFails { .. }) | None => {}
        }
        Ok(inner.resources.get(id).map(|s| self.observe(id, s)))
    }

    async fn create_or_update(
        &self,
        id: &ResourceIdentifier,
        request: &WriteRequest,
    ) -> Result<Submitted<ObservedState>, RemoteError> {
        let kind = match request.mode {
            WriteMode::Put => CallKind::Put,
            WriteMode::Patch => CallKind::Patch,
        };
        let mut inner = self.inner.lock().unwrap();
        self.record(&mut inner, kind, id);
        let operation = if inner.resources.contains_key(id) {
            Operation::Update
        } else {
            Operation::Create
        };
        let mut failure = None;
        match inner.take_fault(kind) {
            Some(Fault::Error(e)) => return Err(e),
            Some(Fault::OperationFails {
                body,
                leave_resource,
            }) => failure = Some((body, leave_resource)),
            Some(Fault::ConcurrentModification) => inner.touch(id),
            Some(Fault::StaleRead) | None => {}
        }
        self.check_write(&inner, id, request)?;
        let effect = Effect::Write {
            body: request.body.clone(),
            mode: request.mode,
        };
        if self.config.operation_polls == 0 && failure.is_none() {
            let stored = self.apply(&mut inner, id, &effect);
            return match stored {
                Some(stored) => Ok(Submitted::Done(self.observe(id, &stored))),
                None => Err(RemoteError::Decode("write produced no resource".to_string())),
            };
        }
        Ok(Submitted::Accepted(self.accept(
            &mut inner, id, operation, effect, failure,
        )))
    }

    async fn delete(&self, id: &ResourceIdentifier) -> Result<Submitted<()>, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        self.record(&mut inner, CallKind::Delete, id);
        let mut failure = None;
        match inner.take_fault(CallKind::Delete) {
            Some(Fault::Error(e)) => return Err(e),
            Some(Fault::OperationFails { body, .. }) => failure = Some((body, true)),
            Some(Fault::StaleRead) | Some(Fault::ConcurrentModification) | None => {}
        }
        if !inner.resources.contains_key(id) {
            return Ok(Submitted::Done(()));
        }
        if self.config.operation_polls == 0 && failure.is_none() {
            self.apply(&mut inner, id, &Effect::Delete);
            return Ok(Submitted::Done(()));
        }
        Ok(Submitted::Accepted(self.accept(
            &mut inner,
            id,
            Operation::Delete,
            Effect::Delete,
            failure,
        )))
    }

    async fn poll_operation(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationStatus, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        self.record(&mut inner, CallKind::Poll, &handle.id);
        if let Some(Fault::Error(e)) = inner.take_fault(CallKind::Poll) {
            return Err(e);
        }
        let pending = inner
            .operations
            .get_mut(&handle.status_url)
            .ok_or_else(|| RemoteError::Client {
                status: 404,
                body: format!("unknown operation {}", handle.status_url),
            })?;
        if pending.remaining_polls > 0 {
            pending.remaining_polls -= 1;
            return Ok(OperationStatus::Running {
                retry_after: self.config.retry_after,
            });
        }
        let pending = match inner.operations.remove(&handle.status_url) {
            Some(pending) => pending,
            None => {
                return Err(RemoteError::Decode(format!(
                    "operation {} vanished",
                    handle.status_url
                )))
            }
        };
        match pending.failure {
            Some((body, leave_resource)) => {
                if leave_resource {
                    if let Effect::Write { body: request, .. } = &pending.effect {
                        if !inner.resources.contains_key(&pending.id) {
                            let mut properties = strip_nulls(request.clone());
                            properties.insert(
                                "provisioningState".to_string(),
                                Value::String("Failed".to_string()),
                            );
                            let etag = inner.bump_etag();
                            inner
                                .resources
                                .insert(pending.id.clone(), Stored { properties, etag });
                        }
                    }
                }
                Ok(OperationStatus::Failed(body))
            }
            None => {
                self.apply(&mut inner, &pending.id, &pending.effect);
                Ok(OperationStatus::Succeeded(None))
            }
        }
    }
}

fn not_found(id: &ResourceIdentifier, code: &str) -> RemoteError {
    RemoteError::Client {
        status: 404,
        body: format!(
            "{{\"code\":\"{}\",\"message\":\"{} was not found\"}}",
            code, id
        ),
    }
}

/// A PUT body's nulls mean "not set".
fn strip_nulls(properties: Properties) -> Properties {
    properties
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| match v {
            Value::Object(m) => (k, Value::Object(strip_nulls(m))),
            v => (k, v),
        })
        .collect()
}

fn substitute_name(value: &Value, name: &str) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace("{name}", name)),
        Value::Object(m) => Value::Object(
            m.iter()
                .map(|(k, v)| (k.clone(), substitute_name(v, name)))
                .collect(),
        ),
        Value::Array(a) => Value::Array(a.iter().map(|v| substitute_name(v, name)).collect()),
        v => v.clone(),
    }
}

fn remove_pointer(value: &mut Value, pointer: &str) {
    let (parent, last) = match pointer.rsplit_once('/') {
        Some(split) => split,
        None => return,
    };
    let target = if parent.is_empty() {
        Some(value)
    } else {
        value.pointer_mut(parent)
    };
    if let Some(Value::Object(m)) = target {
        m.remove(last);
    }
}
