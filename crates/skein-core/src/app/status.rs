//! Status - health / stats のビュー
//!
//! どれも Serialize 可能で、CLI や HTTP 層がそのまま JSON にできます。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::worker::WorkerStatsView;
use crate::observability::StatusCounts;

pub use crate::workflow::{StepView, WorkflowStatusView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, String>,
    pub issues: Vec<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            components: BTreeMap::new(),
            issues: Vec::new(),
        }
    }

    /// Lower the status to `status` if it is worse than the current one.
    pub fn degrade(&mut self, status: HealthStatus, issue: impl Into<String>) {
        let rank = |s: HealthStatus| match s {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        };
        if rank(status) > rank(self.status) {
            self.status = status;
        }
        self.issues.push(issue.into());
    }
}

/// Manager-wide counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Tasks known to this manager, by status.
    pub tasks: StatusCounts,
    pub active_workers: usize,
    pub workers: Vec<WorkerStatsView>,

    /// Local queue name -> pending entries.
    pub queues: BTreeMap<String, usize>,
    pub workflows: usize,
    pub registered_tasks: usize,
}
