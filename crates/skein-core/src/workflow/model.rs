//! Workflow and WorkflowStep.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::graph::DependencyGraph;
use crate::domain::{TaskArgs, TaskStatus, WorkflowError, WorkflowId};
use crate::typed::TaskHandler;

/// One node of a workflow: a handler, its arguments and the steps it waits for.
#[derive(Clone)]
pub struct WorkflowStep {
    pub name: String,
    pub task_func: Arc<dyn TaskHandler>,
    pub args: TaskArgs,
    pub depends_on: BTreeSet<String>,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, task_func: Arc<dyn TaskHandler>) -> Self {
        Self {
            name: name.into(),
            task_func,
            args: TaskArgs::new(),
            depends_on: BTreeSet::new(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn with_args(mut self, args: TaskArgs) -> Self {
        self.args = args;
        self
    }

    pub fn depends_on<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(steps.into_iter().map(Into::into));
        self
    }
}

impl fmt::Debug for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowStep")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("status", &self.status)
            .field("result", &self.result)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// A validated DAG of steps.
///
/// Only constructible through [`Workflow::new`], so `execution_order` is
/// always a valid layering.
#[derive(Debug, Clone)]
pub struct Workflow {
    id: WorkflowId,
    name: String,
    pub(crate) steps: BTreeMap<String, WorkflowStep>,
    execution_order: Vec<Vec<String>>,
    pub(crate) status: TaskStatus,
    pub(crate) results: BTreeMap<String, Value>,
    created_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(
        id: WorkflowId,
        name: impl Into<String>,
        steps: Vec<WorkflowStep>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, WorkflowError> {
        let graph = DependencyGraph::from_steps(steps.iter().map(|step| {
            (
                step.name.as_str(),
                step.depends_on.iter().map(String::as_str),
            )
        }))?;
        let execution_order = graph.levels()?;

        Ok(Self {
            id,
            name: name.into(),
            steps: steps.into_iter().map(|s| (s.name.clone(), s)).collect(),
            execution_order,
            status: TaskStatus::Pending,
            results: BTreeMap::new(),
            created_at,
            started_at: None,
            completed_at: None,
        })
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn execution_order(&self) -> &[Vec<String>] {
        &self.execution_order
    }

    pub fn step(&self, name: &str) -> Option<&WorkflowStep> {
        self.steps.get(name)
    }

    pub fn steps(&self) -> impl Iterator<Item = &WorkflowStep> {
        self.steps.values()
    }

    pub fn results(&self) -> &BTreeMap<String, Value> {
        &self.results
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The first dependency of `step` that has not succeeded, with its status.
    pub(crate) fn unsatisfied_dependency(&self, step: &str) -> Option<(String, TaskStatus)> {
        let step = self.steps.get(step)?;
        step.depends_on.iter().find_map(|dep| {
            let status = self.steps.get(dep).map_or(TaskStatus::Pending, |s| s.status);
            (status != TaskStatus::Success).then(|| (dep.clone(), status))
        })
    }

    pub fn view(&self) -> WorkflowStatusView {
        WorkflowStatusView {
            workflow_id: self.id,
            name: self.name.clone(),
            status: self.status,
            execution_order: self.execution_order.clone(),
            steps: self
                .steps
                .values()
                .map(|s| {
                    (
                        s.name.clone(),
                        StepView {
                            status: s.status,
                            depends_on: s.depends_on.iter().cloned().collect(),
                            error: s.error.clone(),
                        },
                    )
                })
                .collect(),
            results: self.results.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepView {
    pub status: TaskStatus,
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Serializable snapshot of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusView {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub status: TaskStatus,
    pub execution_order: Vec<Vec<String>>,
    pub steps: BTreeMap<String, StepView>,
    pub results: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}
