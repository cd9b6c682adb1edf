//! Workflow runs: aggregates of tasks whose collective terminal state is tracked.
//!
//! # Invariants
//! - A run leaves `Running` only once every task in it is terminal
//! - A run leaves `Running` exactly once

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::ids::RunId;
use crate::task::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(DispatchError::precondition(format!(
                "unknown run status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    /// Name of the workflow template this run instantiates.
    pub template: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_cost_cents: i64,
}

impl WorkflowRun {
    pub fn start(template: impl Into<String>, now: DateTime<Utc>) -> Result<Self> {
        let template = template.into();
        if template.trim().is_empty() {
            return Err(DispatchError::precondition("workflow template must not be empty"));
        }
        Ok(Self {
            id: RunId::new(),
            template,
            status: RunStatus::Running,
            start_time: now,
            end_time: None,
            total_cost_cents: 0,
        })
    }

    /// Close the run. Fails if it was already closed.
    pub fn finish(&mut self, status: RunStatus, total_cost_cents: i64, now: DateTime<Utc>) -> Result<()> {
        if self.status != RunStatus::Running {
            return Err(DispatchError::precondition(format!(
                "workflow run {} already {}",
                self.id, self.status
            )));
        }
        if status == RunStatus::Running {
            return Err(DispatchError::precondition("a run cannot finish as running"));
        }
        self.status = status;
        self.end_time = Some(now);
        self.total_cost_cents = total_cost_cents;
        Ok(())
    }
}

/// Decide a run's final status from its tasks' statuses.
///
/// `None` while any task is non-terminal (or there are no tasks); otherwise
/// `Failed` if any task was quarantined, else `Completed`.
pub fn evaluate_completion<I>(statuses: I) -> Option<RunStatus>
where
    I: IntoIterator<Item = TaskStatus>,
{
    let mut any = false;
    let mut any_quarantined = false;
    for status in statuses {
        if !status.is_terminal() {
            return None;
        }
        any = true;
        any_quarantined |= status == TaskStatus::Quarantined;
    }
    match (any, any_quarantined) {
        (false, _) => None,
        (true, true) => Some(RunStatus::Failed),
        (true, false) => Some(RunStatus::Completed),
    }
}
