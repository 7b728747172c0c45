//! The Lifecycle Reconciler.
//!
//! A [`Reconciler`] drives one resource through
//! `Absent -> Creating -> Present -> (Updating -> Present)* -> Deleting -> Absent`,
//! with `Failed` reachable from every transitional state and `Unknown` used
//! whenever the outcome of a remote operation could not be established.
//!
//! The reconciler keeps the last observation it made. That cache is what
//! makes a repeated `update` free of remote calls; it is refreshed by every
//! mutation and every `read`, and dropped whenever ground truth is in doubt.

use std::{future::Future, sync::Arc, time::Duration};

use fleetform_core::{
    DesiredState, LifecycleState, ObservedState, Operation, OperationHandle, PlanAction,
    Properties, ReconcileError, ReconciliationPlan, RemoteApi, ResourceIdentifier, Submitted,
    WriteMode, WriteRequest,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    diff::diff,
    lock::LockTable,
    lro::{poll_to_completion, PollConfig, PollError, PollOutcome},
    payload,
    retry::{retry_with_backoff, RetryConfig},
    schema::{ResourceSchema, Timeouts},
};

/// How hard and how long a reconciler tries.
#[derive(Clone, Debug, Default)]
pub struct ReconcilePolicy {
    /// For individual remote calls, and for waiting until a create or delete
    /// becomes visible to reads.
    pub retry: RetryConfig,
    pub poll: PollConfig,
    /// Overrides the resource type's default timeouts.
    pub timeouts: Option<Timeouts>,
}

/// Builds reconcilers that share one client, one lock table, one policy and
/// one cancellation token.
#[derive(Clone)]
pub struct ReconcilerFactory {
    client: Arc<dyn RemoteApi>,
    locks: LockTable,
    policy: ReconcilePolicy,
    cancel: CancellationToken,
}

impl ReconcilerFactory {
    pub fn new(client: Arc<dyn RemoteApi>) -> Self {
        ReconcilerFactory {
            client,
            locks: LockTable::new(),
            policy: ReconcilePolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: ReconcilePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn client(&self) -> Arc<dyn RemoteApi> {
        self.client.clone()
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// Cancelling this token cancels the operations of every reconciler
    /// built by this factory.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn reconciler(&self, schema: &'static ResourceSchema, id: ResourceIdentifier) -> Reconciler {
        let (state, _) = watch::channel(LifecycleState::Unknown);
        Reconciler {
            client: self.client.clone(),
            schema,
            id,
            policy: self.policy.clone(),
            locks: self.locks.clone(),
            cancel: self.cancel.clone(),
            state,
            parent: None,
            observed: None,
        }
    }

    /// Parse `raw` against the schema's identifier template and build a
    /// reconciler for it.
    pub fn reconciler_for(
        &self,
        schema: &'static ResourceSchema,
        raw: &str,
    ) -> Result<Reconciler, ReconcileError> {
        let id = schema.id_template.parse(raw).map_err(|source| {
            ReconcileError::MalformedIdentifier {
                operation: Operation::Read,
                source,
            }
        })?;
        Ok(self.reconciler(schema, id))
    }
}

pub struct Reconciler {
    client: Arc<dyn RemoteApi>,
    schema: &'static ResourceSchema,
    id: ResourceIdentifier,
    policy: ReconcilePolicy,
    locks: LockTable,
    cancel: CancellationToken,
    state: watch::Sender<LifecycleState>,
    parent: Option<(ResourceIdentifier, watch::Receiver<LifecycleState>)>,
    observed: Option<ObservedState>,
}

impl Reconciler {
    pub fn id(&self) -> &ResourceIdentifier {
        &self.id
    }

    pub fn schema(&self) -> &'static ResourceSchema {
        self.schema
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Readiness, for dependents and schedulers.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Mutations are rejected while `parent` is known not to be ready.
    pub fn with_parent(mut self, parent: &Reconciler) -> Self {
        self.set_parent(parent.id.clone(), parent.subscribe());
        self
    }

    pub fn set_parent(&mut self, id: ResourceIdentifier, state: watch::Receiver<LifecycleState>) {
        self.parent = Some((id, state));
    }

    /// The last observation, if it is still trusted.
    pub fn observed(&self) -> Option<&ObservedState> {
        self.observed.as_ref()
    }

    fn timeout(&self, operation: Operation) -> Duration {
        self.policy
            .timeouts
            .unwrap_or(self.schema.timeouts)
            .for_operation(operation)
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(id = %self.id, from = %previous, to = %state, "lifecycle state");
        }
    }

    /// Record a fresh observation.
    fn observe(&mut self, observed: Option<ObservedState>) {
        let state = match &observed {
            None => LifecycleState::Absent,
            Some(o) if provisioning_failed(o) => LifecycleState::Failed,
            Some(_) => LifecycleState::Present,
        };
        self.observed = observed;
        self.set_state(state);
    }

    /// Refresh from the remote. `Ok(None)` means the resource is absent,
    /// which callers treat as "needs to be created", not as an error.
    pub async fn read(&mut self) -> Result<Option<ObservedState>, ReconcileError> {
        let span = info_span!("read", id = %self.id);
        let before = self.state();
        let cancel = self.cancel.clone();
        let id = self.id.clone();
        let timeout = self.timeout(Operation::Read);
        let result = cancellable(&cancel, &id, Operation::Read, async {
            match tokio::time::timeout(timeout, self.get_remote(Operation::Read)).await {
                Ok(result) => result,
                Err(_) => Err(ReconcileError::OperationTimeout {
                    id: id.clone(),
                    operation: Operation::Read,
                    timeout,
                }),
            }
        })
        .instrument(span)
        .await;
        match result {
            Ok(observed) => {
                self.observe(observed.clone());
                Ok(observed)
            }
            Err(e) => Err(self.settle(before, e).await),
        }
    }

    /// Create the resource. Fails with `AlreadyExists` if it is already
    /// present: unmanaged resources have to be imported first.
    pub async fn create(&mut self, desired: &DesiredState) -> Result<ObservedState, ReconcileError> {
        let span = info_span!("create", id = %self.id);
        let before = self.state();
        let desired = self
            .schema
            .normalize(&self.id, Operation::Create, &desired.properties)?;
        self.check_parent(Operation::Create)?;
        let cancel = self.cancel.clone();
        let id = self.id.clone();
        let result = cancellable(&cancel, &id, Operation::Create, async {
            let _guard = self.locks.lock(&id).await;
            self.create_locked(&desired, true).await
        })
        .instrument(span)
        .await;
        match result {
            Ok(observed) => Ok(observed),
            Err(e) => Err(self.settle(before, e).await),
        }
    }

    /// Bring the resource in line with `desired`, in place where possible,
    /// by replacement where necessary.
    ///
    /// Plans against the cached observation first; if that plan is empty, no
    /// remote call is made. Otherwise the resource is re-read and re-planned
    /// before anything is written.
    pub async fn update(&mut self, desired: &DesiredState) -> Result<ObservedState, ReconcileError> {
        let span = info_span!("update", id = %self.id);
        let before = self.state();
        let desired = self
            .schema
            .normalize(&self.id, Operation::Update, &desired.properties)?;
        if let Some(observed) = &self.observed {
            if diff(self.schema, &desired, &observed.properties).is_empty() {
                debug!(id = %self.id, "no changes");
                return Ok(observed.clone());
            }
        }
        self.check_parent(Operation::Update)?;
        let cancel = self.cancel.clone();
        let id = self.id.clone();
        let result = cancellable(&cancel, &id, Operation::Update, async {
            let _guard = self.locks.lock(&id).await;
            self.update_locked(&desired).await
        })
        .instrument(span)
        .await;
        match result {
            Ok(observed) => Ok(observed),
            Err(e) => Err(self.settle(before, e).await),
        }
    }

    /// Delete the resource. Deleting an absent resource succeeds.
    pub async fn delete(&mut self) -> Result<(), ReconcileError> {
        let span = info_span!("delete", id = %self.id);
        let before = self.state();
        let cancel = self.cancel.clone();
        let id = self.id.clone();
        let result = cancellable(&cancel, &id, Operation::Delete, async {
            let _guard = self.locks.lock(&id).await;
            self.delete_locked(Operation::Delete).await
        })
        .instrument(span)
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.settle(before, e).await),
        }
    }

    /// What `update` (or `create`, if the resource is absent) would change.
    /// Uses the cached observation when there is one.
    pub async fn plan(&mut self, desired: &DesiredState) -> Result<ReconciliationPlan, ReconcileError> {
        let desired = self
            .schema
            .normalize(&self.id, Operation::Plan, &desired.properties)?;
        let observed = match &self.observed {
            Some(observed) => Some(observed.clone()),
            None if self.state() == LifecycleState::Absent => None,
            None => self.read().await?,
        };
        let empty = Default::default();
        let observed = observed.as_ref().map_or(&empty, |o| &o.properties);
        Ok(diff(self.schema, &desired, observed))
    }

    async fn create_locked(
        &mut self,
        desired: &Properties,
        ensure_absent: bool,
    ) -> Result<ObservedState, ReconcileError> {
        if ensure_absent {
            if let Some(existing) = self.get_remote(Operation::Create).await? {
                self.observe(Some(existing));
                return Err(ReconcileError::AlreadyExists {
                    id: self.id.clone(),
                    operation: Operation::Create,
                });
            }
        }
        self.set_state(LifecycleState::Creating);
        info!(id = %self.id, "creating");
        let request = WriteRequest {
            mode: WriteMode::Put,
            body: payload::create_body(self.schema, desired),
            if_match: None,
        };
        self.write(Operation::Create, &request).await?;
        let observed = self.await_presence(Operation::Create, true).await?;
        self.observe(observed.clone());
        observed.ok_or_else(|| ReconcileError::not_found(&self.id, Operation::Create))
    }

    async fn update_locked(
        &mut self,
        desired: &Properties,
    ) -> Result<ObservedState, ReconcileError> {
        let mut observed = self.refresh_present(Operation::Update).await?;
        let mut conflicts = 0;
        loop {
            let plan = diff(self.schema, desired, &observed.properties);
            if plan.is_empty() {
                return Ok(observed);
            }
            if plan.requires_replace {
                return self.replace_locked(desired, &plan).await;
            }
            self.set_state(LifecycleState::Updating);
            info!(id = %self.id, changes = plan.changes.len(), "updating in place");
            let request = WriteRequest {
                mode: self.schema.write_mode,
                body: payload::update_body(self.schema, desired, &observed.properties),
                if_match: observed.etag.clone(),
            };
            match self.write(Operation::Update, &request).await {
                Ok(()) => break,
                Err(ReconcileError::Conflict { message, .. }) if conflicts == 0 => {
                    conflicts += 1;
                    warn!(id = %self.id, %message, "concurrent modification, refreshing and planning again");
                    observed = self.refresh_present(Operation::Update).await?;
                }
                Err(e) => return Err(e),
            }
        }
        let observed = self.await_presence(Operation::Update, true).await?;
        self.observe(observed.clone());
        observed.ok_or_else(|| ReconcileError::not_found(&self.id, Operation::Update))
    }

    async fn replace_locked(
        &mut self,
        desired: &Properties,
        plan: &ReconciliationPlan,
    ) -> Result<ObservedState, ReconcileError> {
        let fields: Vec<String> = plan
            .changes
            .iter()
            .filter(|c| matches!(c.action, PlanAction::Replace { .. }))
            .map(|c| c.path.to_string())
            .collect();
        info!(id = %self.id, fields = ?fields, "replacing");
        self.delete_locked(Operation::Replace).await?;
        match self.create_locked(desired, false).await {
            Ok(observed) => Ok(observed),
            Err(e) => {
                let source = self.settle(LifecycleState::Absent, e).await;
                Err(ReconcileError::ReplacementPartialFailure {
                    id: self.id.clone(),
                    operation: Operation::Replace,
                    state: self.state(),
                    source: Box::new(source),
                })
            }
        }
    }

    async fn delete_locked(&mut self, operation: Operation) -> Result<(), ReconcileError> {
        self.set_state(LifecycleState::Deleting);
        info!(id = %self.id, "deleting");
        let client = self.client.clone();
        let id = &self.id;
        let submitted = retry_with_backoff(&self.policy.retry, "delete", || client.delete(id))
            .await
            .map_err(|f| ReconcileError::from_remote(id, operation, f.attempts, f.error))?;
        if let Submitted::Accepted(handle) = submitted {
            self.wait(operation, &handle).await?;
        }
        self.await_presence(operation, false).await?;
        self.observe(None);
        Ok(())
    }

    /// Submit a write and wait for it to complete.
    async fn write(&self, operation: Operation, request: &WriteRequest) -> Result<(), ReconcileError> {
        let client = self.client.clone();
        let id = &self.id;
        let submitted = retry_with_backoff(&self.policy.retry, "create_or_update", || {
            client.create_or_update(id, request)
        })
        .await
        .map_err(|f| ReconcileError::from_remote(id, operation, f.attempts, f.error))?;
        match submitted {
            Submitted::Done(_) => Ok(()),
            Submitted::Accepted(handle) => self.wait(operation, &handle).await.map(|_| ()),
        }
    }

    async fn wait(
        &self,
        operation: Operation,
        handle: &OperationHandle,
    ) -> Result<Option<ObservedState>, ReconcileError> {
        let timeout = self.timeout(operation);
        debug!(id = %self.id, %operation, status_url = %handle.status_url, "waiting for operation");
        let outcome = poll_to_completion(
            self.client.as_ref(),
            handle,
            &self.policy.poll,
            &self.policy.retry,
            timeout,
        )
        .await;
        match outcome {
            Ok(PollOutcome::Succeeded(observed)) => Ok(observed),
            Ok(PollOutcome::Failed(body)) => Err(ReconcileError::OperationFailed {
                id: self.id.clone(),
                operation,
                remote_error: body,
            }),
            Ok(PollOutcome::Canceled(body)) => Err(ReconcileError::OperationFailed {
                id: self.id.clone(),
                operation,
                remote_error: format!("the remote canceled the operation: {}", body),
            }),
            Err(PollError::Timeout(timeout)) => Err(ReconcileError::OperationTimeout {
                id: self.id.clone(),
                operation,
                timeout,
            }),
            Err(PollError::Remote(f)) => Err(ReconcileError::from_remote(
                &self.id,
                operation,
                f.attempts,
                f.error,
            )),
        }
    }

    async fn get_remote(&self, operation: Operation) -> Result<Option<ObservedState>, ReconcileError> {
        let client = self.client.clone();
        let id = &self.id;
        retry_with_backoff(&self.policy.retry, "get", || client.get(id))
            .await
            .map_err(|f| ReconcileError::from_remote(id, operation, f.attempts, f.error))
    }

    async fn refresh_present(&mut self, operation: Operation) -> Result<ObservedState, ReconcileError> {
        let observed = self.get_remote(operation).await?;
        self.observe(observed.clone());
        observed.ok_or_else(|| ReconcileError::not_found(&self.id, operation))
    }

    /// Reads can lag behind completed writes. Read until the resource's
    /// presence matches `present`, bounded by the retry policy.
    async fn await_presence(
        &self,
        operation: Operation,
        present: bool,
    ) -> Result<Option<ObservedState>, ReconcileError> {
        let mut backoff = self.policy.retry.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let observed = self.get_remote(operation).await?;
            if observed.is_some() == present {
                return Ok(observed);
            }
            if !self.policy.retry.allows_another(attempt) {
                return Err(ReconcileError::OperationFailed {
                    id: self.id.clone(),
                    operation,
                    remote_error: format!(
                        "the operation completed, but the resource is still {} after {} reads",
                        if present { "absent" } else { "present" },
                        attempt
                    ),
                });
            }
            let delay = backoff.next_delay();
            debug!(id = %self.id, attempt, delay_ms = delay.as_millis(), "waiting for a consistent read");
            tokio::time::sleep(delay).await;
        }
    }

    fn check_parent(&self, operation: Operation) -> Result<(), ReconcileError> {
        let Some((parent, state)) = &self.parent else {
            return Ok(());
        };
        let parent_state = *state.borrow();
        match parent_state {
            LifecycleState::Unknown | LifecycleState::Present | LifecycleState::Updating => Ok(()),
            LifecycleState::Absent
            | LifecycleState::Creating
            | LifecycleState::Deleting
            | LifecycleState::Failed => Err(ReconcileError::ParentNotReady {
                id: self.id.clone(),
                operation,
                parent: parent.clone(),
                parent_state,
            }),
        }
    }

    /// Work out what a failure means for the lifecycle state.
    async fn settle(&mut self, before: LifecycleState, error: ReconcileError) -> ReconcileError {
        match &error {
            ReconcileError::Canceled { .. } => {
                self.observed = None;
                self.set_state(LifecycleState::Unknown);
            }
            ReconcileError::OperationFailed { .. } => {
                // Best effort: the failed operation may or may not have left
                // something behind.
                match self.client.get(&self.id).await {
                    Ok(None) => self.observe(None),
                    Ok(Some(observed)) => {
                        self.observed = Some(observed);
                        self.set_state(LifecycleState::Failed);
                    }
                    Err(e) => {
                        debug!(id = %self.id, error = %e, "could not read after failure");
                        self.observed = None;
                        self.set_state(LifecycleState::Unknown);
                    }
                }
            }
            ReconcileError::OperationTimeout { .. }
            | ReconcileError::TransientFailure { .. }
            | ReconcileError::Remote { .. } => {
                self.observed = None;
                self.set_state(LifecycleState::Unknown);
            }
            ReconcileError::NotFound { .. } => self.observe(None),
            ReconcileError::ReplacementPartialFailure { .. } => {}
            _ => {
                if matches!(
                    self.state(),
                    LifecycleState::Creating | LifecycleState::Updating | LifecycleState::Deleting
                ) {
                    self.set_state(before);
                }
            }
        }
        warn!(id = %self.id, error = %error, state = %self.state(), "operation failed");
        error
    }
}

fn provisioning_failed(observed: &ObservedState) -> bool {
    observed.properties.get("provisioningState") == Some(&Value::String("Failed".to_string()))
}

/// Run `fut` unless `cancel` fires first. Dropping `fut` stops local work
/// only; a remote operation that was already submitted keeps running.
async fn cancellable<T>(
    cancel: &CancellationToken,
    id: &ResourceIdentifier,
    operation: Operation,
    fut: impl Future<Output = Result<T, ReconcileError>>,
) -> Result<T, ReconcileError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReconcileError::canceled(id, operation)),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use fleetform_core::RemoteError;
    use fleetform_resources_memory::{CallKind, Fault, MemoryControlPlane, PlaneConfig, TypeBehavior};
    use serde_json::json;

    use super::*;
    use crate::catalog::{CONTAINER_REGISTRY, KUBERNETES_CLUSTER, KUBERNETES_CLUSTER_NODE_POOL};

    const CLUSTER: &str = "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/rg/providers/Microsoft.ContainerService/managedClusters/aks1";
    const POOL: &str = "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/rg/providers/Microsoft.ContainerService/managedClusters/aks1/agentPools/pool1";
    const REGISTRY: &str =
        "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/rg/providers/Microsoft.ContainerRegistry/registries/acr1";

    fn desired(v: Value) -> DesiredState {
        DesiredState::from(v)
    }

    fn pool(node_count: u64) -> DesiredState {
        desired(json!({"vmSize": "Standard_DS2_v2", "nodeCount": node_count}))
    }

    fn registry() -> DesiredState {
        desired(json!({"location": "westeurope", "sku": {"name": "Basic"}}))
    }

    /// A control plane with an existing cluster.
    fn plane(config: PlaneConfig) -> Arc<MemoryControlPlane> {
        let plane = MemoryControlPlane::new(config).with_type(
            "Microsoft.ContainerService/managedClusters/agentPools",
            TypeBehavior {
                computed: json!({"provisioningState": "Succeeded"})
                    .as_object()
                    .unwrap()
                    .clone(),
                ..TypeBehavior::default()
            },
        );
        plane.insert(
            &CLUSTER.parse().unwrap(),
            json!({"location": "westeurope", "dnsPrefix": "aks1"})
                .as_object()
                .unwrap()
                .clone(),
        );
        Arc::new(plane)
    }

    fn pool_reconciler(factory: &ReconcilerFactory) -> Reconciler {
        factory
            .reconciler_for(&KUBERNETES_CLUSTER_NODE_POOL, POOL)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn create_waits_for_the_operation_and_reads_back() {
        let plane = plane(PlaneConfig::default());
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);
        let mut readiness = r.subscribe();

        let observed = r.create(&pool(1)).await.unwrap();

        assert_eq!(observed.properties["nodeCount"], json!(1));
        assert_eq!(observed.properties["provisioningState"], json!("Succeeded"));
        assert_eq!(observed.properties["mode"], json!("User"));
        assert!(observed.etag.is_some());
        assert_eq!(r.state(), LifecycleState::Present);
        assert!(readiness.has_changed().unwrap());
        assert_eq!(*readiness.borrow_and_update(), LifecycleState::Present);
        let kinds: Vec<CallKind> = plane.calls().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CallKind::Get,
                CallKind::Put,
                CallKind::Poll,
                CallKind::Poll,
                CallKind::Poll,
                CallKind::Get
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn create_refuses_to_take_over_existing_resources() {
        let plane = plane(PlaneConfig::default());
        let id = POOL.parse().unwrap();
        plane.insert(&id, json!({"vmSize": "Standard_DS2_v2"}).as_object().unwrap().clone());
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);

        let err = r.create(&pool(1)).await.unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::AlreadyExists {
                operation: Operation::Create,
                ..
            }
        ));
        assert_eq!(r.state(), LifecycleState::Present);
        assert_eq!(plane.mutation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_desired_state_makes_no_remote_calls() {
        let plane = plane(PlaneConfig::default());
        plane.clear_calls();
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);

        let err = r
            .create(&desired(json!({"vmSize": "Standard_DS2_v2", "nodeCount": 1, "nodeCont": 2})))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, ReconcileError::InvalidRequest { message, .. } if message == "unknown property nodeCont")
        );

        let err = r
            .create(&desired(json!({
                "vmSize": "Standard_DS2_v2",
                "enableAutoScaling": true,
                "minCount": 5,
                "maxCount": 3
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidRequest { .. }));
        assert!(plane.calls().is_empty());
        assert_eq!(r.state(), LifecycleState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_wait_for_the_parent() {
        let plane = Arc::new(MemoryControlPlane::default());
        let factory = ReconcilerFactory::new(plane.clone());
        let mut cluster = factory.reconciler_for(&KUBERNETES_CLUSTER, CLUSTER).unwrap();
        let mut r = pool_reconciler(&factory).with_parent(&cluster);

        assert_eq!(cluster.read().await.unwrap(), None);
        assert_eq!(cluster.state(), LifecycleState::Absent);
        plane.clear_calls();

        let err = r.create(&pool(1)).await.unwrap_err();
        match err {
            ReconcileError::ParentNotReady {
                parent,
                parent_state,
                ..
            } => {
                assert_eq!(parent, cluster.id().clone());
                assert_eq!(parent_state, LifecycleState::Absent);
            }
            e => panic!("unexpected error: {}", e),
        }
        assert!(plane.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_desired_state_is_not_written() {
        let plane = plane(PlaneConfig::default());
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);
        r.create(&pool(1)).await.unwrap();
        plane.clear_calls();

        r.update(&pool(1)).await.unwrap();
        r.update(&pool(1)).await.unwrap();

        assert!(plane.calls().is_empty());
        assert!(r.plan(&pool(1)).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drift_is_corrected_in_place() {
        let plane = plane(PlaneConfig::default());
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);
        r.create(&pool(1)).await.unwrap();
        let id = r.id().clone();
        plane.modify(&id, |p| {
            p.insert("nodeCount".to_string(), json!(4));
        });

        r.read().await.unwrap();
        let plan = r.plan(&pool(1)).await.unwrap();
        assert_eq!(plan.changes.len(), 1);
        assert!(!plan.requires_replace);
        plane.clear_calls();

        let observed = r.update(&pool(1)).await.unwrap();

        assert_eq!(observed.properties["nodeCount"], json!(1));
        assert_eq!(
            plane.calls().iter().filter(|c| c.kind == CallKind::Put).count(),
            1
        );
        assert_eq!(r.state(), LifecycleState::Present);
    }

    #[tokio::test(start_paused = true)]
    async fn one_concurrent_modification_is_absorbed() {
        let plane = plane(PlaneConfig::default());
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);
        r.create(&pool(1)).await.unwrap();
        plane.fail_next(CallKind::Put, Fault::ConcurrentModification);
        plane.clear_calls();

        let observed = r.update(&pool(3)).await.unwrap();

        assert_eq!(observed.properties["nodeCount"], json!(3));
        assert_eq!(
            plane.calls().iter().filter(|c| c.kind == CallKind::Put).count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_concurrent_modification_is_a_conflict() {
        let plane = plane(PlaneConfig::default());
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);
        r.create(&pool(1)).await.unwrap();
        plane.fail_next(CallKind::Put, Fault::ConcurrentModification);
        plane.fail_next(CallKind::Put, Fault::ConcurrentModification);

        let err = r.update(&pool(3)).await.unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Conflict {
                operation: Operation::Update,
                ..
            }
        ));
        assert_eq!(r.state(), LifecycleState::Present);
        assert_eq!(plane.stored(r.id()).unwrap()["nodeCount"], json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn update_of_a_vanished_resource_is_not_found() {
        let plane = plane(PlaneConfig::default());
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);
        r.create(&pool(1)).await.unwrap();
        plane.remove(r.id());

        let err = r.update(&pool(2)).await.unwrap_err();

        assert!(matches!(err, ReconcileError::NotFound { .. }));
        assert_eq!(r.state(), LifecycleState::Absent);
        assert!(r.observed().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_then_surfaced() {
        let plane = plane(PlaneConfig::default());
        for _ in 0..5 {
            plane.fail_next(
                CallKind::Get,
                Fault::Error(RemoteError::Server {
                    status: 503,
                    body: "ServiceUnavailable".to_string(),
                }),
            );
        }
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);

        let err = r.create(&pool(1)).await.unwrap_err();

        match err {
            ReconcileError::TransientFailure {
                attempts,
                last_error,
                operation,
                ..
            } => {
                assert_eq!(attempts, 5);
                assert_eq!(operation, Operation::Create);
                assert!(matches!(last_error, RemoteError::Server { status: 503, .. }));
            }
            e => panic!("unexpected error: {}", e),
        }
        assert_eq!(r.state(), LifecycleState::Unknown);
        assert_eq!(plane.mutation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttling_is_waited_out() {
        let plane = plane(PlaneConfig::default());
        plane.fail_next(
            CallKind::Put,
            Fault::Error(RemoteError::Throttled {
                retry_after: Some(Duration::from_secs(17)),
            }),
        );
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);
        let start = tokio::time::Instant::now();

        r.create(&pool(1)).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(17));
        assert_eq!(r.state(), LifecycleState::Present);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_operation_that_leaves_a_resource_behind() {
        let plane = plane(PlaneConfig::default());
        plane.fail_next(
            CallKind::Put,
            Fault::OperationFails {
                body: "{\"code\":\"VMExtensionProvisioningError\"}".to_string(),
                leave_resource: true,
            },
        );
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);

        let err = r.create(&pool(1)).await.unwrap_err();

        assert!(matches!(
            &err,
            ReconcileError::OperationFailed { remote_error, .. }
                if remote_error.contains("VMExtensionProvisioningError")
        ));
        assert_eq!(r.state(), LifecycleState::Failed);
        assert_eq!(
            r.observed().unwrap().properties["provisioningState"],
            json!("Failed")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polling_gives_up_after_the_timeout() {
        let plane = plane(PlaneConfig {
            operation_polls: 10_000,
            ..PlaneConfig::default()
        });
        let factory = ReconcilerFactory::new(plane.clone()).with_policy(ReconcilePolicy {
            timeouts: Some(Timeouts::minutes(2, 1, 2, 2)),
            ..ReconcilePolicy::default()
        });
        let mut r = pool_reconciler(&factory);

        let err = r.create(&pool(1)).await.unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::OperationTimeout { timeout, operation: Operation::Create, .. }
                if timeout == Duration::from_secs(120)
        ));
        assert_eq!(r.state(), LifecycleState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_polling_but_trusts_the_next_read() {
        let plane = plane(PlaneConfig {
            operation_polls: 10_000,
            ..PlaneConfig::default()
        });
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);
        let cancel = factory.cancellation();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            cancel.cancel();
        });

        let err = r.create(&pool(1)).await.unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Canceled {
                operation: Operation::Create,
                ..
            }
        ));
        assert_eq!(r.state(), LifecycleState::Unknown);
        assert!(r.observed().is_none());
        assert_eq!(
            plane.calls().iter().filter(|c| c.kind == CallKind::Put).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delete_is_idempotent() {
        let plane = plane(PlaneConfig::default());
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);
        r.create(&pool(1)).await.unwrap();

        r.delete().await.unwrap();
        assert_eq!(r.state(), LifecycleState::Absent);
        assert!(!plane.contains(r.id()));
        assert_eq!(r.read().await.unwrap(), None);

        r.delete().await.unwrap();
        assert_eq!(r.state(), LifecycleState::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_reads_after_create_are_waited_out() {
        let plane = plane(PlaneConfig {
            operation_polls: 0,
            ..PlaneConfig::default()
        });
        let factory = ReconcilerFactory::new(plane.clone());
        let mut r = pool_reconciler(&factory);
        // The first stale read is spent on the existence check, the second
        // one delays the read-back.
        plane.fail_next(CallKind::Get, Fault::StaleRead);
        plane.fail_next(CallKind::Get, Fault::StaleRead);

        let observed = r.create(&pool(2)).await;
        assert_eq!(observed.unwrap().properties["nodeCount"], json!(2));
        assert_eq!(
            plane.calls().iter().filter(|c| c.kind == CallKind::Get).count(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn plan_for_an_absent_resource_creates_everything() {
        let plane = Arc::new(MemoryControlPlane::synchronous());
        let factory = ReconcilerFactory::new(plane);
        let mut r = factory.reconciler_for(&CONTAINER_REGISTRY, REGISTRY).unwrap();

        let plan = r.plan(&registry()).await.unwrap();

        let paths: Vec<String> = plan.changes.iter().map(|c| c.path.to_string()).collect();
        assert!(paths.contains(&"sku".to_string()));
        assert!(paths.contains(&"adminUserEnabled".to_string()));
        assert_eq!(r.state(), LifecycleState::Absent);
    }

    #[test]
    fn raw_identifiers_must_match_the_type() {
        let factory = ReconcilerFactory::new(Arc::new(MemoryControlPlane::synchronous()));
        let err = factory
            .reconciler_for(&KUBERNETES_CLUSTER_NODE_POOL, REGISTRY)
            .err()
            .unwrap();
        assert!(matches!(err, ReconcileError::MalformedIdentifier { .. }));
    }
}
