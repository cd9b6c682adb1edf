//! Core Task type and its lifecycle state machine.
//!
//! # Invariants
//! - `status == Claimed` => `assigned_worker.is_some()`
//! - `status in {Pending, AwaitingBudgetApproval}` => `assigned_worker.is_none()`
//! - `retry_count <= max_retries`
//! - `max_retries >= 1`
//!
//! All status changes go through [`Task::transition`], which consults the closed
//! transition table in [`TaskStatus::can_transition_to`].

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::ids::{ResourceId, RunId, TaskId, WorkerId};

/// Retries granted to a task when the creator does not say otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Urgency band of a task. Lower ordinal is claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Ordinal used for claim ordering: Critical=1 ... Low=4.
    pub fn ordinal(self) -> u8 {
        match self {
            Priority::Critical => 1,
            Priority::High => 2,
            Priority::Medium => 3,
            Priority::Low => 4,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Result<Self> {
        match ordinal {
            1 => Ok(Priority::Critical),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Medium),
            4 => Ok(Priority::Low),
            other => Err(DispatchError::precondition(format!(
                "malformed priority ordinal {}",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(DispatchError::precondition(format!(
                "malformed priority '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Claimed -> Done
///    |  ^        |  \-> Quarantined
///    |  |        \----> Pending (retry)
///    v  |
/// AwaitingBudgetApproval
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a qualified worker
    Pending,
    /// Held by exactly one worker
    Claimed,
    /// Completed successfully
    Done,
    /// Retries exhausted; needs manual review
    Quarantined,
    /// Budget charge rejected with no usable fallback
    AwaitingBudgetApproval,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Claimed,
        TaskStatus::Done,
        TaskStatus::Quarantined,
        TaskStatus::AwaitingBudgetApproval,
    ];

    /// `true` for Done and Quarantined.
    ///
    /// # Property
    /// `is_terminal() => no next status is legal`
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Quarantined)
    }

    /// The closed transition table. Anything not listed here is illegal.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Done)
                | (Claimed, Pending)
                | (Claimed, Quarantined)
                | (Pending, AwaitingBudgetApproval)
                | (AwaitingBudgetApproval, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Done => "done",
            TaskStatus::Quarantined => "quarantined",
            TaskStatus::AwaitingBudgetApproval => "awaiting_budget_approval",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DispatchError::precondition(format!("unknown task status '{}'", s)))
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to create a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: Priority,
    /// Absent or empty means any worker may claim the task.
    #[serde(default)]
    pub required_capabilities: Option<BTreeSet<String>>,
    #[serde(default)]
    pub parent_task_id: Option<TaskId>,
    #[serde(default)]
    pub workflow_run_id: Option<RunId>,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, priority: Priority) -> Self {
        Self {
            title: title.into(),
            description: None,
            priority,
            required_capabilities: None,
            parent_task_id: None,
            workflow_run_id: None,
            max_retries: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = Some(capabilities.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent_task_id = Some(parent);
        self
    }

    pub fn in_run(mut self, run: RunId) -> Self {
        self.workflow_run_id = Some(run);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A unit of work tracked by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    pub required_capabilities: Option<BTreeSet<String>>,
    pub assigned_worker: Option<WorkerId>,
    pub parent_task_id: Option<TaskId>,
    pub workflow_run_id: Option<RunId>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    /// Resource whose rejected charge parked this task, while AwaitingBudgetApproval.
    pub awaiting_resource: Option<ResourceId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh Pending task.
    ///
    /// # Errors
    /// `PreconditionViolation` for an empty title, `max_retries == 0`, or a blank
    /// capability tag.
    pub fn create(new: NewTask, default_max_retries: u32, now: DateTime<Utc>) -> Result<Self> {
        let title = new.title.trim().to_string();
        if title.is_empty() {
            return Err(DispatchError::precondition("task title must not be empty"));
        }
        let max_retries = new.max_retries.unwrap_or(default_max_retries);
        if max_retries == 0 {
            return Err(DispatchError::precondition("max_retries must be at least 1"));
        }
        if let Some(caps) = &new.required_capabilities {
            if caps.iter().any(|c| c.trim().is_empty()) {
                return Err(DispatchError::precondition(
                    "capability tags must not be blank",
                ));
            }
        }

        Ok(Self {
            id: TaskId::new(),
            title,
            description: new.description,
            status: TaskStatus::Pending,
            priority: new.priority,
            required_capabilities: new.required_capabilities,
            assigned_worker: None,
            parent_task_id: new.parent_task_id,
            workflow_run_id: new.workflow_run_id,
            retry_count: 0,
            max_retries,
            last_error: None,
            awaiting_resource: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Move to `next` if the transition table allows it.
    pub(crate) fn transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DispatchError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Pending -> Claimed by `worker`.
    pub fn claim(&mut self, worker: WorkerId, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Claimed, now)?;
        self.assigned_worker = Some(worker);
        Ok(())
    }

    /// Reject unless the task is Claimed by `worker`.
    pub fn ensure_owned_by(&self, worker: WorkerId) -> Result<()> {
        if self.status == TaskStatus::Claimed && self.assigned_worker == Some(worker) {
            Ok(())
        } else {
            Err(DispatchError::OwnershipViolation {
                task_id: self.id,
                worker_id: worker,
            })
        }
    }

    /// Owner-reported completion: Claimed -> Done | Quarantined.
    pub fn finish(&mut self, worker: WorkerId, status: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        if !status.is_terminal() {
            return Err(DispatchError::precondition(format!(
                "status updates only accept done or quarantined, got {}",
                status
            )));
        }
        self.ensure_owned_by(worker)?;
        self.transition(status, now)?;
        self.assigned_worker = None;
        Ok(())
    }

    /// Pending -> AwaitingBudgetApproval after a rejected charge against `resource`.
    pub fn hold_for_budget(&mut self, resource: ResourceId, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::AwaitingBudgetApproval, now)?;
        self.awaiting_resource = Some(resource);
        Ok(())
    }

    /// AwaitingBudgetApproval -> Pending after an administrative budget increase.
    pub fn release_budget_hold(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Pending, now)?;
        self.awaiting_resource = None;
        Ok(())
    }

    /// Check the row-level invariants. Stores call this before committing.
    pub fn check_invariants(&self) -> Result<()> {
        match self.status {
            TaskStatus::Claimed if self.assigned_worker.is_none() => Err(
                DispatchError::precondition(format!("claimed task {} has no worker", self.id)),
            ),
            TaskStatus::Pending | TaskStatus::AwaitingBudgetApproval
                if self.assigned_worker.is_some() =>
            {
                Err(DispatchError::precondition(format!(
                    "{} task {} still has a worker",
                    self.status, self.id
                )))
            }
            _ if self.retry_count > self.max_retries => Err(DispatchError::precondition(
                format!("task {} exceeded its retry limit", self.id),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_task() -> Task {
        Task::create(NewTask::new("index repo", Priority::Medium), 3, Utc::now()).unwrap()
    }

    #[test]
    fn test_transition_table_is_closed() {
        use TaskStatus::*;
        let legal = [
            (Pending, Claimed),
            (Claimed, Done),
            (Claimed, Pending),
            (Claimed, Quarantined),
            (Pending, AwaitingBudgetApproval),
            (AwaitingBudgetApproval, Pending),
        ];
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
        assert!(TaskStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .all(|s| TaskStatus::ALL.iter().all(|n| !s.can_transition_to(*n))));
    }

    #[test]
    fn test_priority_ordinals_and_parsing() {
        assert_eq!(Priority::Critical.ordinal(), 1);
        assert_eq!(Priority::Low.ordinal(), 4);
        assert_eq!("High".parse::<Priority>().unwrap(), Priority::High);
        assert!(matches!(
            "urgent".parse::<Priority>(),
            Err(DispatchError::PreconditionViolation(_))
        ));
        assert!(Priority::from_ordinal(0).is_err());
    }

    #[test]
    fn test_create_validates_input() {
        let now = Utc::now();
        assert!(Task::create(NewTask::new("  ", Priority::Low), 3, now).is_err());
        assert!(Task::create(NewTask::new("t", Priority::Low).with_max_retries(0), 3, now).is_err());
        assert!(Task::create(NewTask::new("t", Priority::Low).with_capabilities([""]), 3, now).is_err());

        let task = Task::create(NewTask::new("t", Priority::Low), 5, now).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.max_retries, 5);
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn test_claim_and_finish_require_ownership() {
        let mut task = pending_task();
        let owner = WorkerId::new();
        let other = WorkerId::new();
        task.claim(owner, Utc::now()).unwrap();
        assert_eq!(task.assigned_worker, Some(owner));
        task.check_invariants().unwrap();

        let before = task.clone();
        assert!(matches!(
            task.finish(other, TaskStatus::Done, Utc::now()),
            Err(DispatchError::OwnershipViolation { .. })
        ));
        assert_eq!(task, before);

        assert!(task.finish(owner, TaskStatus::Pending, Utc::now()).is_err());
        task.finish(owner, TaskStatus::Done, Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.assigned_worker, None);
    }

    #[test]
    fn test_budget_hold_round_trip() {
        let mut task = pending_task();
        let resource = ResourceId::new();
        task.hold_for_budget(resource, Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::AwaitingBudgetApproval);
        assert_eq!(task.awaiting_resource, Some(resource));
        assert!(task.claim(WorkerId::new(), Utc::now()).is_err());

        task.release_budget_hold(Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.awaiting_resource, None);
    }
}
