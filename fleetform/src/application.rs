use crate::config::Deployment;
use crate::control::task_tracker::TaskTracker;
use crate::interrupt::InterruptState;
use crate::options::Options;
use crate::state::StateFile;
use crate::work::WorkContext;
use anyhow::{Context, Result};
use fleetform_remote_http::{HttpConfig, HttpControlPlane};
use fleetform_resource::ReconcilerFactory;
use fleetform_resources_memory::{MemoryControlPlane, PlaneConfig};
use std::future::Future;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Create the single-threaded tokio runtime used by the CLI.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Could not initialize the tokio runtime")
}

/// Handle a Result, printing the error and exiting with code 1 on failure.
pub fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("fleetform error: {:?}", e);
            exit(1);
        }
    }
}

/// The reconciler factory for the control plane selected by `options`.
pub fn reconciler_factory(
    interrupt_state: &InterruptState,
    options: &Options,
) -> Result<ReconcilerFactory> {
    let factory = if options.simulate {
        info!("simulating against an empty in-memory control plane");
        ReconcilerFactory::new(Arc::new(MemoryControlPlane::new(PlaneConfig {
            operation_polls: 1,
            retry_after: Some(Duration::from_millis(50)),
            require_parents: true,
            record_calls: false,
        })))
    } else {
        let mut config = HttpConfig::new(options.endpoint.clone());
        if let Some(token) = &options.token {
            config = config.with_token(token.clone());
        }
        ReconcilerFactory::new(Arc::new(HttpControlPlane::new(config)?))
    };
    Ok(factory.with_cancellation(interrupt_state.token()))
}

/// Open the state file, unless simulating.
pub fn open_state(options: &Options) -> Result<Option<StateFile>> {
    if options.simulate {
        return Ok(None);
    }
    StateFile::open(&options.state).map(Some)
}

/// Run a command against the deployment.
///
/// Loads the deployment document and the state file, sets up a
/// `WorkContext` and its `TaskTracker`, and hands both to `f`.
pub async fn with_deployment<F, Fut, R>(
    interrupt_state: &InterruptState,
    options: &Options,
    f: F,
) -> Result<R>
where
    F: FnOnce(Arc<WorkContext>, TaskTracker<WorkContext>) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let deployment = Deployment::load(&options.file)?;
    let factory = reconciler_factory(interrupt_state, options)?;
    let state = open_state(options)?;
    let tasks = WorkContext::new(interrupt_state.clone(), &factory, deployment, state).tasks();
    let result = f(tasks.work().clone(), tasks).await;
    and_interrupted(result, interrupt_state)
}

/// An interrupted run fails, even when everything it got to finished.
fn and_interrupted<T>(primary: Result<T>, interrupt_state: &InterruptState) -> Result<T> {
    match (primary, interrupt_state.check_interrupted()) {
        (Ok(r), Ok(())) => Ok(r),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), _) => Err(e),
    }
}
