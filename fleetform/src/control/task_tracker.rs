//! Runs goals at most once each, in dependency order, refusing cycles.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
};
use tokio::{
    sync::{Mutex, OnceCell},
    task::JoinHandle,
};

/// What a [`TaskTracker`] runs. Tasks reach their dependencies through the
/// [`TaskContext`] passed to [`work`](TaskWork::work), which records each edge.
#[async_trait::async_trait]
pub trait TaskWork: Send + Sync + Sized + 'static {
    type Output: Clone + Send + Sync + 'static;
    type Key: Clone + Ord + fmt::Display + Send + Sync + 'static;
    type CycleError;

    /// Run the task for `key`.
    async fn work(&self, context: TaskContext<Self>, key: Self::Key) -> Self::Output;

    /// Turn a refused dependency into the task's error type.
    fn cycle_error(&self, cycle: Cycle<Self::Key>) -> Self::CycleError;
}

struct Task<Key, Output> {
    result: Arc<OnceCell<Output>>,
    dependencies: Vec<Key>,
}

type Tasks<Work> = BTreeMap<
    <Work as TaskWork>::Key,
    Task<<Work as TaskWork>::Key, <Work as TaskWork>::Output>,
>;

/// Every key is worked on at most once; later requests for the same key
/// wait for, and then share, the first result. Tasks name their
/// dependencies through the [`TaskContext`] they are given, and a
/// dependency that would close a cycle is refused with
/// [`TaskWork::cycle_error`] instead of deadlocking.
pub struct TaskTracker<Work: TaskWork> {
    work: Arc<Work>,
    tasks: Arc<Mutex<Tasks<Work>>>,
}

// derive(Clone) would require `Work: Clone`
impl<Work: TaskWork> Clone for TaskTracker<Work> {
    fn clone(&self) -> Self {
        TaskTracker {
            work: self.work.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

impl<Work: TaskWork> TaskTracker<Work> {
    pub fn new(work: Arc<Work>) -> Self {
        TaskTracker {
            work,
            tasks: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn work(&self) -> &Arc<Work> {
        &self.work
    }

    async fn cell(&self, key: &Work::Key) -> Arc<OnceCell<Work::Output>> {
        let mut tasks = self.tasks.lock().await;
        tasks
            .entry(key.clone())
            .or_insert_with(|| Task {
                result: Arc::new(OnceCell::new()),
                dependencies: Vec::new(),
            })
            .result
            .clone()
    }

    /// Run the task for `key`, or wait for the run that is already under way.
    pub async fn run(&self, key: Work::Key) -> Work::Output {
        let cell = self.cell(&key).await;
        let context = TaskContext {
            tracker: self.clone(),
            key: key.clone(),
        };
        cell.get_or_init(|| self.work.work(context, key))
            .await
            .clone()
    }

    /// Run the tasks for `keys` concurrently, returning their results in the
    /// same order.
    pub async fn run_all(&self, keys: Vec<Work::Key>) -> Vec<(Work::Key, Work::Output)> {
        let handles: Vec<(Work::Key, JoinHandle<Work::Output>)> = keys
            .into_iter()
            .map(|key| {
                let tracker = self.clone();
                let task_key = key.clone();
                (key, tokio::spawn(async move { tracker.run(task_key).await }))
            })
            .collect();
        let mut results = Vec::with_capacity(handles.len());
        for (key, handle) in handles {
            match handle.await {
                Ok(output) => results.push((key, output)),
                // Tasks are never aborted, so this is a panic.
                Err(e) => std::panic::resume_unwind(e.into_panic()),
            }
        }
        results
    }
}

/// Passed to [`TaskWork::work`], to start the tasks the current task depends on.
pub struct TaskContext<Work: TaskWork> {
    tracker: TaskTracker<Work>,
    key: Work::Key,
}

impl<Work: TaskWork> Clone for TaskContext<Work> {
    fn clone(&self) -> Self {
        TaskContext {
            tracker: self.tracker.clone(),
            key: self.key.clone(),
        }
    }
}

impl<Work: TaskWork> TaskContext<Work> {
    pub fn key(&self) -> &Work::Key {
        &self.key
    }

    async fn add_dependency(&self, dependency: &Work::Key) -> Result<(), Work::CycleError> {
        let mut tasks = self.tracker.tasks.lock().await;

        let cycle = path_to::<Work>(&tasks, dependency, &self.key, &mut BTreeSet::new());
        if let Some(mut path) = cycle {
            path.push(self.key.clone());
            return Err(self.tracker.work.cycle_error(Cycle { path }));
        }

        if let Some(task) = tasks.get_mut(&self.key) {
            if !task.dependencies.contains(dependency) {
                task.dependencies.push(dependency.clone());
            }
        }
        Ok(())
    }

    /// Start the task for `key` in the background.
    pub async fn spawn(
        &self,
        key: Work::Key,
    ) -> Result<JoinHandle<Work::Output>, Work::CycleError> {
        self.add_dependency(&key).await?;
        let tracker = self.tracker.clone();
        Ok(tokio::spawn(async move { tracker.run(key).await }))
    }

    /// Run the task for `key` and wait for its result.
    #[allow(clippy::type_complexity)]
    pub fn require(
        &self,
        key: Work::Key,
    ) -> Pin<Box<dyn Future<Output = Result<Work::Output, Work::CycleError>> + Send + '_>>
    where
        Work::CycleError: Send,
    {
        Box::pin(async move {
            self.add_dependency(&key).await?;
            Ok(self.tracker.run(key).await)
        })
    }
}

// Depth-first search along recorded dependencies. The graphs are a handful of
// resources, so nothing is kept between searches.
fn path_to<Work: TaskWork>(
    tasks: &Tasks<Work>,
    from: &Work::Key,
    to: &Work::Key,
    seen: &mut BTreeSet<Work::Key>,
) -> Option<Vec<Work::Key>> {
    if from == to {
        return Some(Vec::new());
    }
    if !seen.insert(from.clone()) {
        return None;
    }
    let task = tasks.get(from)?;
    for next in &task.dependencies {
        if let Some(mut path) = path_to::<Work>(tasks, next, to, seen) {
            path.insert(0, from.clone());
            return Some(path);
        }
    }
    None
}

/// A cycle in the task graph.
///
/// Each element of [`path`](Cycle::path) depends on the next one; the last
/// depends on the first, which is not repeated.
#[derive(Clone, PartialEq, Eq)]
pub struct Cycle<Key> {
    path: Vec<Key>,
}

impl<Key> Cycle<Key> {
    pub fn path(&self) -> &[Key] {
        &self.path
    }
}

impl<Key: fmt::Display> fmt::Display for Cycle<Key> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for key in &self.path {
            write!(f, "{} -> ", key)?;
        }
        match self.path.first() {
            Some(first) => write!(f, "{}", first),
            None => Ok(()),
        }
    }
}

impl<Key: fmt::Debug> fmt::Debug for Cycle<Key> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for key in &self.path {
            write!(f, "{:?} -> ", key)?;
        }
        match self.path.first() {
            Some(first) => write!(f, "{:?}", first),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;

    /// Resources and what they depend on. The output of a task is the list of
    /// resources it has seen finish, itself last.
    struct Graph {
        edges: BTreeMap<&'static str, Vec<&'static str>>,
        runs: StdMutex<Vec<String>>,
    }

    impl Graph {
        /// `(resource, dependency)` pairs.
        fn new(edges: &[(&'static str, &'static str)]) -> Arc<Self> {
            let mut map: BTreeMap<&'static str, Vec<&'static str>> = BTreeMap::new();
            for (resource, dependency) in edges {
                map.entry(*resource).or_default().push(*dependency);
            }
            Arc::new(Graph {
                edges: map,
                runs: StdMutex::new(Vec::new()),
            })
        }

        fn runs(&self) -> Vec<String> {
            self.runs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskWork for Graph {
        type Output = Result<Vec<String>, Cycle<String>>;
        type Key = String;
        type CycleError = Cycle<String>;

        async fn work(&self, context: TaskContext<Self>, key: String) -> Self::Output {
            let mut seen = Vec::new();
            let dependencies = self.edges.get(key.as_str()).cloned().unwrap_or_default();
            let mut handles = Vec::new();
            for dependency in dependencies {
                handles.push(context.spawn(dependency.to_string()).await?);
            }
            for handle in handles {
                for name in handle.await.unwrap()? {
                    if !seen.contains(&name) {
                        seen.push(name);
                    }
                }
            }
            self.runs.lock().unwrap().push(key.clone());
            seen.push(key);
            Ok(seen)
        }

        fn cycle_error(&self, cycle: Cycle<String>) -> Cycle<String> {
            cycle
        }
    }

    #[tokio::test]
    async fn shared_parents_are_reconciled_once() {
        let graph = Graph::new(&[("system", "aks"), ("user", "aks"), ("user", "acr")]);
        let tasks = TaskTracker::new(graph.clone());
        let results = tasks
            .run_all(vec!["user".to_string(), "system".to_string()])
            .await;

        assert_eq!(results[0].0, "user");
        assert_eq!(results[0].1.as_ref().unwrap().last().unwrap(), "user");
        assert_eq!(results[1].0, "system");
        assert_eq!(
            results[1].1.as_ref().unwrap(),
            &vec!["aks".to_string(), "system".to_string()]
        );

        let mut runs = graph.runs();
        let position = |name: &str| runs.iter().position(|r| r == name).unwrap();
        assert!(position("aks") < position("system"));
        assert!(position("aks") < position("user"));
        assert!(position("acr") < position("user"));
        runs.sort();
        assert_eq!(runs, vec!["acr", "aks", "system", "user"]);
    }

    #[tokio::test]
    async fn later_requests_share_the_first_result() {
        let graph = Graph::new(&[("pool", "aks")]);
        let tasks = TaskTracker::new(graph.clone());
        tasks.run("pool".to_string()).await.unwrap();
        tasks.run("pool".to_string()).await.unwrap();
        tasks.run("aks".to_string()).await.unwrap();
        assert_eq!(graph.runs(), vec!["aks", "pool"]);
    }

    #[tokio::test]
    async fn cycles_name_every_resource_on_them() {
        let graph = Graph::new(&[("vnet", "aks"), ("aks", "pool"), ("pool", "vnet")]);
        let tasks = TaskTracker::new(graph.clone());
        let cycle = tasks.run("vnet".to_string()).await.unwrap_err();
        assert_eq!(cycle.path().len(), 3);
        let text = cycle.to_string();
        for name in ["vnet", "aks", "pool"] {
            assert!(text.contains(name), "{text}");
        }
        let first = &cycle.path()[0];
        assert!(text.starts_with(first.as_str()) && text.ends_with(first.as_str()));
        assert!(graph.runs().is_empty());
    }

    #[tokio::test]
    async fn resources_cannot_depend_on_themselves() {
        let graph = Graph::new(&[("acr", "acr")]);
        let tasks = TaskTracker::new(graph);
        let cycle = tasks.run("acr".to_string()).await.unwrap_err();
        assert_eq!(cycle.path(), &["acr".to_string()]);
        assert_eq!(cycle.to_string(), "acr -> acr");
    }
}
