//! Level-by-level workflow execution.
//!
//! - levels run strictly in order
//! - steps of a level are spawned together and joined (fan-out / fan-in)
//! - a level with any non-SUCCESS step ends the workflow as FAILURE and
//!   later levels never start

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::model::Workflow;
use crate::domain::{TaskArgs, TaskStatus, WorkflowError};
use crate::ports::Clock;
use crate::typed::{HandlerError, TaskHandler};

/// A workflow shared between its runner and status readers.
pub type SharedWorkflow = Arc<Mutex<Workflow>>;

/// Drive `workflow` to a terminal status.
pub async fn run_workflow(workflow: SharedWorkflow, clock: Arc<dyn Clock>) {
    let (id, levels) = {
        let mut wf = workflow.lock().await;
        if wf.status != TaskStatus::Pending {
            return;
        }
        wf.status = TaskStatus::Running;
        wf.started_at = Some(clock.now());
        (wf.id(), wf.execution_order().to_vec())
    };
    info!(workflow = %id, levels = levels.len(), "workflow started");

    for (index, level) in levels.iter().enumerate() {
        let runnable = start_level(&workflow, level).await;

        let outcomes = join_all(runnable.into_iter().map(|(name, handler, args)| async move {
            let outcome = tokio::spawn(async move { handler.invoke(args).await }).await;
            (name, outcome)
        }))
        .await;

        let mut wf = workflow.lock().await;
        for (name, outcome) in outcomes {
            record_step(&mut wf, &name, outcome);
        }

        let failed: Vec<&str> = level
            .iter()
            .filter(|name| wf.step(name).is_none_or(|s| s.status != TaskStatus::Success))
            .map(String::as_str)
            .collect();
        if !failed.is_empty() {
            warn!(workflow = %id, level = index, failed = ?failed, "workflow failed");
            wf.status = TaskStatus::Failure;
            wf.completed_at = Some(clock.now());
            return;
        }
        debug!(workflow = %id, level = index, "workflow level completed");
    }

    let mut wf = workflow.lock().await;
    wf.status = TaskStatus::Success;
    wf.completed_at = Some(clock.now());
    info!(workflow = %id, "workflow completed");
}

type Runnable = (String, Arc<dyn TaskHandler>, TaskArgs);

/// Re-check dependencies and mark the runnable steps RUNNING.
///
/// A step whose dependency has not succeeded stays PENDING with the reason
/// in `error` and is left out.
async fn start_level(workflow: &SharedWorkflow, level: &[String]) -> Vec<Runnable> {
    let mut wf = workflow.lock().await;
    let mut runnable = Vec::with_capacity(level.len());

    for name in level {
        if let Some((dependency, status)) = wf.unsatisfied_dependency(name) {
            let err = WorkflowError::DependencyNotSatisfied {
                step: name.clone(),
                dependency,
                status,
            };
            warn!(workflow = %wf.id(), step = %name, error = %err, "step not started");
            if let Some(step) = wf.steps.get_mut(name) {
                step.error = Some(err.to_string());
            }
            continue;
        }

        if let Some(step) = wf.steps.get_mut(name) {
            step.status = TaskStatus::Running;
            runnable.push((name.clone(), Arc::clone(&step.task_func), step.args.clone()));
        }
    }
    runnable
}

fn record_step(
    wf: &mut Workflow,
    name: &str,
    outcome: Result<Result<Value, HandlerError>, tokio::task::JoinError>,
) {
    let id = wf.id();
    let Some(step) = wf.steps.get_mut(name) else {
        return;
    };

    match outcome {
        Ok(Ok(value)) => {
            step.status = TaskStatus::Success;
            step.result = Some(value.clone());
            wf.results.insert(name.to_string(), value);
        }
        Ok(Err(err)) => {
            warn!(workflow = %id, step = %name, error = %err, "step failed");
            step.status = TaskStatus::Failure;
            step.error = Some(err.to_string());
        }
        Err(join) => {
            warn!(workflow = %id, step = %name, error = %join, "step panicked");
            step.status = TaskStatus::Failure;
            step.error = Some(format!("step panicked: {join}"));
        }
    }
}
