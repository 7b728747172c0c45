use crate::{
    config::{Deployment, Resource},
    control::task_tracker::{Cycle, TaskContext, TaskTracker, TaskWork},
    interrupt::InterruptState,
    state::{ResourceRecord, StateFile},
};
use anyhow::{anyhow, bail, Context as _, Result};
use fleetform_core::{LifecycleState, ObservedState, ReconciliationPlan};
use fleetform_resource::{Reconciler, ReconcilerFactory};
use std::{collections::BTreeMap, fmt::Display, sync::Arc};
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument as _};

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Goal {
    /// Read a resource and record what was seen.
    Refresh(String),
    /// Work out what `Apply` would change.
    Plan(String),
    /// Create or update a resource, after the resources it depends on.
    Apply(String),
    /// Delete a resource, after the resources that depend on it.
    Destroy(String),
}

impl Goal {
    pub fn resource(&self) -> &str {
        match self {
            Goal::Refresh(name) | Goal::Plan(name) | Goal::Apply(name) | Goal::Destroy(name) => {
                name
            }
        }
    }
}

impl Display for Goal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Goal::Refresh(name) => write!(f, "Refresh resource {}", name),
            Goal::Plan(name) => write!(f, "Plan resource {}", name),
            Goal::Apply(name) => write!(f, "Apply resource {}", name),
            Goal::Destroy(name) => write!(f, "Destroy resource {}", name),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Outcome {
    Observed(Option<ObservedState>),
    Planned {
        /// The resource does not exist yet.
        create: bool,
        plan: ReconciliationPlan,
    },
    Applied(ObservedState),
    Destroyed,
}

pub type GoalResult = std::result::Result<Outcome, Arc<anyhow::Error>>;

pub struct WorkContext {
    pub interrupt_state: InterruptState,
    pub deployment: Deployment,
    reconcilers: BTreeMap<String, Mutex<Reconciler>>,
    /// `None` when simulating.
    state: Option<Mutex<StateFile>>,
}

impl WorkContext {
    pub fn new(
        interrupt_state: InterruptState,
        factory: &ReconcilerFactory,
        deployment: Deployment,
        state: Option<StateFile>,
    ) -> Self {
        let mut reconcilers: BTreeMap<String, Reconciler> = deployment
            .resources()
            .map(|r| (r.name.clone(), factory.reconciler(r.schema, r.id.clone())))
            .collect();

        // Children refuse to mutate while their parent is known not to be ready.
        let links: Vec<_> = deployment
            .resources()
            .filter_map(|r| {
                let parent = reconcilers.get(r.parent.as_ref()?)?;
                Some((r.name.clone(), parent.id().clone(), parent.subscribe()))
            })
            .collect();
        for (name, parent_id, parent_state) in links {
            if let Some(child) = reconcilers.get_mut(&name) {
                child.set_parent(parent_id, parent_state);
            }
        }

        WorkContext {
            interrupt_state,
            deployment,
            reconcilers: reconcilers
                .into_iter()
                .map(|(name, r)| (name, Mutex::new(r)))
                .collect(),
            state: state.map(Mutex::new),
        }
    }

    pub fn tasks(self) -> TaskTracker<WorkContext> {
        TaskTracker::new(Arc::new(self))
    }

    fn resource(&self, name: &str) -> Result<(&Resource, &Mutex<Reconciler>)> {
        match (self.deployment.get(name), self.reconcilers.get(name)) {
            (Some(resource), Some(reconciler)) => Ok((resource, reconciler)),
            _ => bail!("Resource {} is not in the deployment", name),
        }
    }

    async fn record(
        &self,
        command: &str,
        resource: &Resource,
        observed: Option<&ObservedState>,
    ) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        let mut state = state.lock().await;
        match observed {
            Some(observed) => state.record(
                command,
                &resource.name,
                &ResourceRecord::new(resource.schema.type_name, &resource.id, observed),
            ),
            None => state.forget(command, &resource.name),
        }
        .with_context(|| format!("Could not record the state of {}", resource.name))
    }

    /// Start `goals` in the background and wait for all of them, failing if
    /// any of them failed.
    async fn require_all(
        &self,
        context: &TaskContext<Self>,
        goals: Vec<Goal>,
        relation: &str,
    ) -> Result<()> {
        let mut handles = Vec::new();
        for goal in goals {
            let handle = context.spawn(goal.clone()).await?;
            handles.push((goal, handle));
        }
        for (goal, handle) in handles {
            let result = handle
                .await
                .with_context(|| format!("{} did not complete", goal))?;
            if let Err(e) = result {
                bail!(
                    "{} {} of {} failed: {}",
                    relation,
                    goal.resource(),
                    context.key().resource(),
                    e
                );
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // NOTE: perform_* functions should only be called from the work() function
    // and should not be called directly, so that we can ensure that work is
    // deduplicated and that we don't have cycles.
    // -----------------------------------------------------------------------

    async fn perform_refresh(&self, name: &str) -> Result<Outcome> {
        let (resource, reconciler) = self.resource(name)?;
        let mut reconciler = reconciler.lock().await;
        let observed = reconciler.read().await?;
        self.record("refresh", resource, observed.as_ref()).await?;
        Ok(Outcome::Observed(observed))
    }

    async fn perform_plan(&self, context: &TaskContext<Self>, name: &str) -> Result<Outcome> {
        let (resource, reconciler) = self.resource(name)?;
        let observed = match context.require(Goal::Refresh(name.to_string())).await? {
            Ok(Outcome::Observed(observed)) => observed,
            Ok(other) => bail!("Unexpected outcome when refreshing {}: {:?}", name, other),
            Err(e) => bail!("Could not refresh {}: {}", name, e),
        };
        // Plans against the observation the refresh left in the reconciler.
        let plan = reconciler.lock().await.plan(&resource.desired).await?;
        Ok(Outcome::Planned {
            create: observed.is_none(),
            plan,
        })
    }

    async fn perform_apply(&self, context: &TaskContext<Self>, name: &str) -> Result<Outcome> {
        let (resource, reconciler) = self.resource(name)?;
        let dependencies = resource
            .depends_on
            .iter()
            .map(|d| Goal::Apply(d.clone()))
            .collect();
        self.require_all(context, dependencies, "Dependency")
            .await?;
        self.interrupt_state.check_interrupted()?;

        let mut reconciler = reconciler.lock().await;
        let result = match reconciler.read().await? {
            None => reconciler.create(&resource.desired).await,
            Some(_) => reconciler.update(&resource.desired).await,
        };
        match result {
            Ok(observed) => {
                self.record("apply", resource, Some(&observed)).await?;
                Ok(Outcome::Applied(observed))
            }
            Err(e) => {
                if reconciler.state() == LifecycleState::Absent {
                    self.record("apply", resource, None).await?;
                }
                Err(e.into())
            }
        }
    }

    async fn perform_destroy(&self, context: &TaskContext<Self>, name: &str) -> Result<Outcome> {
        let (resource, reconciler) = self.resource(name)?;
        let dependents = self
            .deployment
            .dependents(name)
            .into_iter()
            .map(Goal::Destroy)
            .collect();
        self.require_all(context, dependents, "Dependent")
            .await?;
        self.interrupt_state.check_interrupted()?;

        let mut reconciler = reconciler.lock().await;
        reconciler.delete().await?;
        self.record("destroy", resource, None).await?;
        Ok(Outcome::Destroyed)
    }
}

#[async_trait::async_trait]
impl TaskWork for WorkContext {
    type Output = GoalResult;

    type Key = Goal;

    type CycleError = anyhow::Error;

    fn cycle_error(&self, cycle: Cycle<Self::Key>) -> Self::CycleError {
        anyhow!("Dependency cycle detected: {}", cycle)
    }

    async fn work(&self, context: TaskContext<Self>, key: Self::Key) -> Self::Output {
        let span = info_span!("goal", resource = %key.resource());
        let r = match &key {
            Goal::Refresh(name) => {
                self.perform_refresh(name)
                    .instrument(info_span!(parent: &span, "Refreshing resource"))
                    .await
            }
            Goal::Plan(name) => {
                self.perform_plan(&context, name)
                    .instrument(info_span!(parent: &span, "Planning resource"))
                    .await
            }
            Goal::Apply(name) => {
                self.perform_apply(&context, name)
                    .instrument(info_span!(parent: &span, "Applying resource"))
                    .await
            }
            Goal::Destroy(name) => {
                self.perform_destroy(&context, name)
                    .instrument(info_span!(parent: &span, "Destroying resource"))
                    .await
            }
        };
        if let Err(e) = &r {
            warn!(resource = %key.resource(), "{}: {:#}", key, e);
        }
        r.map_err(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use fleetform_core::{PlanAction, ResourceIdentifier};
    use fleetform_resources_memory::{CallKind, MemoryControlPlane};
    use serde_json::json;

    use super::*;
    use crate::config::tests::{example, pool_id, resolve, CLUSTER_ID, REGISTRY_ID};

    struct Fixture {
        plane: Arc<MemoryControlPlane>,
        factory: ReconcilerFactory,
        _dir: tempfile::TempDir,
        state_path: std::path::PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let plane = Arc::new(MemoryControlPlane::synchronous());
            let factory = ReconcilerFactory::new(plane.clone());
            let dir = tempfile::tempdir().unwrap();
            let state_path = dir.path().join("state.json");
            Fixture {
                plane,
                factory,
                _dir: dir,
                state_path,
            }
        }

        fn tasks(&self, document: serde_json::Value) -> TaskTracker<WorkContext> {
            let state = StateFile::open(&self.state_path).unwrap();
            WorkContext::new(
                InterruptState::new(),
                &self.factory,
                resolve(document).unwrap(),
                Some(state),
            )
            .tasks()
        }

        fn mutations(&self) -> Vec<(CallKind, ResourceIdentifier)> {
            self.plane
                .calls()
                .into_iter()
                .filter(|c| c.is_mutation())
                .map(|c| (c.kind, c.id))
                .collect()
        }
    }

    fn id(raw: &str) -> ResourceIdentifier {
        raw.parse().unwrap()
    }

    fn goals(make: fn(String) -> Goal, names: &[&str]) -> Vec<Goal> {
        names.iter().map(|n| make(n.to_string())).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn apply_creates_parents_first() {
        let fixture = Fixture::new();
        let tasks = fixture.tasks(example());

        let results = tasks
            .run_all(goals(Goal::Apply, &["pool", "acr", "aks"]))
            .await;
        for (goal, result) in &results {
            assert!(
                matches!(result, Ok(Outcome::Applied(_))),
                "{}: {:?}",
                goal,
                result
            );
        }

        let writes: Vec<_> = fixture.mutations().into_iter().map(|(_, id)| id).collect();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[2], id(&pool_id("pool1")));

        let state = StateFile::open(&fixture.state_path).unwrap();
        assert_eq!(state.resource_names(), vec!["acr", "aks", "pool"]);
        let pool = state.resource("pool").unwrap();
        assert_eq!(pool.type_name, "kubernetes_cluster_node_pool");
        assert_eq!(pool.properties["vmSize"], json!("Standard_DS2_v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn apply_again_changes_nothing() {
        let fixture = Fixture::new();
        let tasks = fixture.tasks(example());
        tasks.run_all(goals(Goal::Apply, &["aks", "acr", "pool"])).await;
        fixture.plane.clear_calls();

        let tasks = fixture.tasks(example());
        let results = tasks.run_all(goals(Goal::Apply, &["aks", "acr", "pool"])).await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(fixture.mutations(), vec![]);
    }

    #[tokio::test(start_paused = true)]
    async fn plan_reports_creates_and_changes() {
        let fixture = Fixture::new();
        fixture.tasks(example()).run(Goal::Apply("acr".to_string())).await.unwrap();

        let mut document = example();
        document["resources"]["acr"]["properties"]["sku"] = json!({"name": "Standard"});
        let tasks = fixture.tasks(document);
        let results: BTreeMap<Goal, GoalResult> = tasks
            .run_all(goals(Goal::Plan, &["acr", "aks"]))
            .await
            .into_iter()
            .collect();

        match &results[&Goal::Plan("acr".to_string())] {
            Ok(Outcome::Planned { create, plan }) => {
                assert!(!create);
                assert_eq!(plan.changes.len(), 1);
                assert_eq!(plan.changes[0].path.to_string(), "sku.name");
                assert_eq!(
                    plan.changes[0].action,
                    PlanAction::Set {
                        value: json!("Standard")
                    }
                );
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        match &results[&Goal::Plan("aks".to_string())] {
            Ok(Outcome::Planned { create, plan }) => {
                assert!(create);
                assert!(!plan.is_empty());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        // Planning writes nothing remotely, but records what it saw.
        assert_eq!(fixture.mutations().len(), 1);
        let state = StateFile::open(&fixture.state_path).unwrap();
        assert_eq!(state.resource_names(), vec!["acr"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dependencies_stop_dependents() {
        let fixture = Fixture::new();
        let mut document = example();
        // Unknown property: rejected before any remote call.
        document["resources"]["acr"]["properties"]["color"] = json!("blue");
        let tasks = fixture.tasks(document);

        let results: BTreeMap<Goal, GoalResult> = tasks
            .run_all(goals(Goal::Apply, &["aks", "acr", "pool"]))
            .await
            .into_iter()
            .collect();

        assert!(results[&Goal::Apply("aks".to_string())].is_ok());
        let acr = results[&Goal::Apply("acr".to_string())].as_ref().unwrap_err();
        assert!(format!("{:#}", acr).contains("unknown property color"));
        let pool = results[&Goal::Apply("pool".to_string())].as_ref().unwrap_err();
        assert!(format!("{}", pool).contains("Dependency acr of pool failed"));
        assert!(!fixture.plane.contains(&id(&pool_id("pool1"))));
    }

    #[tokio::test(start_paused = true)]
    async fn dependency_cycles_are_reported() {
        let fixture = Fixture::new();
        let mut document = example();
        document["resources"]["acr"]["dependsOn"] = json!(["pool"]);
        let tasks = fixture.tasks(document);

        let result = tasks.run(Goal::Apply("pool".to_string())).await;
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("Dependency cycle detected"), "{}", message);
        assert!(!fixture.plane.contains(&id(&pool_id("pool1"))));
        assert!(!fixture.plane.contains(&id(REGISTRY_ID)));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_deletes_children_first() {
        let fixture = Fixture::new();
        fixture
            .tasks(example())
            .run_all(goals(Goal::Apply, &["aks", "acr", "pool"]))
            .await;
        fixture.plane.clear_calls();

        let tasks = fixture.tasks(example());
        let results = tasks
            .run_all(goals(Goal::Destroy, &["aks", "acr", "pool"]))
            .await;
        assert!(results.iter().all(|(_, r)| matches!(r, Ok(Outcome::Destroyed))));

        let deletes: Vec<_> = fixture.mutations().into_iter().map(|(_, id)| id).collect();
        let position = |raw: &str| deletes.iter().position(|d| d == &id(raw)).unwrap();
        assert!(position(&pool_id("pool1")) < position(CLUSTER_ID));
        assert!(position(&pool_id("pool1")) < position(REGISTRY_ID));
        assert!(!fixture.plane.contains(&id(CLUSTER_ID)));

        let state = StateFile::open(&fixture.state_path).unwrap();
        assert!(state.resource_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_forgets_vanished_resources() {
        let fixture = Fixture::new();
        fixture
            .tasks(example())
            .run(Goal::Apply("acr".to_string()))
            .await
            .unwrap();
        fixture.plane.remove(&id(REGISTRY_ID));

        let result = fixture
            .tasks(example())
            .run(Goal::Refresh("acr".to_string()))
            .await;
        assert!(matches!(result, Ok(Outcome::Observed(None))));
        let state = StateFile::open(&fixture.state_path).unwrap();
        assert_eq!(state.resource("acr"), None);
    }
}
