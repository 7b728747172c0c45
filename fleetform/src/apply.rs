use anyhow::Result;

use crate::{
    application::with_deployment,
    interrupt::InterruptState,
    options::Options,
    plan::{check_results, select},
    work::{Goal, Outcome},
};

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// Resources to apply, along with what they depend on; all of them by default
    resources: Vec<String>,
}

#[derive(clap::Parser, Debug)]
pub(crate) struct DestroyArgs {
    /// Resources to destroy, along with what depends on them; all of them by default
    resources: Vec<String>,
}

/// Run the `apply` command.
pub(crate) async fn apply(
    interrupt_state: &InterruptState,
    options: &Options,
    args: &Args,
) -> Result<()> {
    with_deployment(interrupt_state, options, |context, tasks| async move {
        let names = select(&context.deployment, &args.resources)?;
        if context.deployment.is_empty() {
            eprintln!("Deployment contains no resources; nothing to apply.");
            return Ok(());
        }
        let results = tasks
            .run_all(names.into_iter().map(Goal::Apply).collect())
            .await;
        for (goal, result) in &results {
            if let Ok(Outcome::Applied(_)) = result {
                eprintln!("{}: applied", goal.resource());
            }
        }
        check_results(&results)
    })
    .await
}

/// Run the `destroy` command.
pub(crate) async fn destroy(
    interrupt_state: &InterruptState,
    options: &Options,
    args: &DestroyArgs,
) -> Result<()> {
    with_deployment(interrupt_state, options, |context, tasks| async move {
        let names = select(&context.deployment, &args.resources)?;
        let results = tasks
            .run_all(names.into_iter().map(Goal::Destroy).collect())
            .await;
        for (goal, result) in &results {
            if let Ok(Outcome::Destroyed) = result {
                eprintln!("{}: destroyed", goal.resource());
            }
        }
        check_results(&results)
    })
    .await
}
