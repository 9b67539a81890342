//! Workflow: named DAG of steps executed level by level.

mod executor;
mod graph;
mod model;

pub use executor::{SharedWorkflow, run_workflow};
pub use graph::DependencyGraph;
pub use model::{StepView, Workflow, WorkflowStatusView, WorkflowStep};
