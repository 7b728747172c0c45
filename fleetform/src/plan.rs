use std::collections::BTreeMap;

use anyhow::{bail, Result};
use fleetform_core::{PlanAction, ReconciliationPlan};
use serde::Serialize;

use crate::{
    application::with_deployment,
    config::Deployment,
    interrupt::InterruptState,
    options::Options,
    work::{Goal, GoalResult, Outcome},
};

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// Print the plan as JSON on stdout
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Resources to plan; all of them by default
    resources: Vec<String>,
}

#[derive(clap::Parser, Debug)]
pub(crate) struct RefreshArgs {
    /// Resources to refresh; all of them by default
    resources: Vec<String>,
}

/// The resources named on the command line, or all of them.
pub(crate) fn select(deployment: &Deployment, names: &[String]) -> Result<Vec<String>> {
    if names.is_empty() {
        return Ok(deployment.names());
    }
    for name in names {
        if deployment.get(name).is_none() {
            bail!(
                "Resource {} is not in the deployment; it has: {}",
                name,
                deployment.names().join(", ")
            );
        }
    }
    Ok(names.to_vec())
}

/// Fail if any goal failed. The failures were logged as they happened.
pub(crate) fn check_results(results: &[(Goal, GoalResult)]) -> Result<()> {
    let failed: Vec<&Goal> = results
        .iter()
        .filter(|(_, r)| r.is_err())
        .map(|(g, _)| g)
        .collect();
    match failed.len() {
        0 => Ok(()),
        1 => bail!("{} failed", failed[0]),
        n => bail!("{} resources failed", n),
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
enum Action {
    Create,
    Replace,
    Update,
    None,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourcePlan {
    action: Action,
    #[serde(flatten)]
    plan: ReconciliationPlan,
}

impl ResourcePlan {
    fn new(create: bool, plan: ReconciliationPlan) -> Self {
        let action = if create {
            Action::Create
        } else if plan.requires_replace {
            Action::Replace
        } else if plan.is_empty() {
            Action::None
        } else {
            Action::Update
        };
        ResourcePlan { action, plan }
    }
}

fn render(name: &str, resource: &ResourcePlan) -> String {
    let mut out = match resource.action {
        Action::Create => format!("+ {} will be created\n", name),
        Action::Replace => format!("-/+ {} will be replaced\n", name),
        Action::Update => format!("~ {} will be updated in place\n", name),
        Action::None => return format!("  {} is up to date\n", name),
    };
    for change in &resource.plan.changes {
        let line = match &change.action {
            PlanAction::Set { value } => format!("    {} = {}\n", change.path, value),
            PlanAction::Unset => format!("    {} removed\n", change.path),
            PlanAction::Replace { old, new } => format!(
                "    {}: {} -> {} (forces replacement)\n",
                change.path,
                old.as_ref().map_or("(none)".to_string(), |v| v.to_string()),
                new.as_ref().map_or("(none)".to_string(), |v| v.to_string()),
            ),
        };
        out.push_str(&line);
    }
    out
}

pub(crate) async fn plan(
    interrupt_state: &InterruptState,
    options: &Options,
    args: &Args,
) -> Result<()> {
    with_deployment(interrupt_state, options, |context, tasks| async move {
        let names = select(&context.deployment, &args.resources)?;
        let results = tasks
            .run_all(names.into_iter().map(Goal::Plan).collect())
            .await;
        check_results(&results)?;

        let plans: BTreeMap<String, ResourcePlan> = results
            .into_iter()
            .filter_map(|(goal, result)| match result {
                Ok(Outcome::Planned { create, plan }) => Some((
                    goal.resource().to_string(),
                    ResourcePlan::new(create, plan),
                )),
                _ => None,
            })
            .collect();

        if args.json {
            println!("{}", serde_json::to_string_pretty(&plans)?);
        } else {
            for (name, plan) in &plans {
                eprint!("{}", render(name, plan));
            }
            let pending = plans.values().filter(|p| p.action != Action::None).count();
            eprintln!("{} of {} resources have changes.", pending, plans.len());
        }
        Ok(())
    })
    .await
}

pub(crate) async fn refresh(
    interrupt_state: &InterruptState,
    options: &Options,
    args: &RefreshArgs,
) -> Result<()> {
    with_deployment(interrupt_state, options, |context, tasks| async move {
        let names = select(&context.deployment, &args.resources)?;
        let results = tasks
            .run_all(names.into_iter().map(Goal::Refresh).collect())
            .await;
        for (goal, result) in &results {
            match result {
                Ok(Outcome::Observed(Some(_))) => eprintln!("{}: present", goal.resource()),
                Ok(Outcome::Observed(None)) => eprintln!("{}: absent", goal.resource()),
                _ => {}
            }
        }
        check_results(&results)
    })
    .await
}
