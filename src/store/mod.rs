//! Dispatch storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory rows with per-row locks (non-persistent, for tests and
//!   single-process deployments)
//! - `sqlite`: SQLite database; every operation is one `BEGIN IMMEDIATE`
//!   transaction
//!
//! Each method is one atomic unit. Implementations build the new row states on
//! copies and write them back only when every check passed, so a failed call
//! leaves no partial writes. Notifications are the caller's job, after the
//! method returns.

mod memory;
mod sqlite;

pub use memory::InMemoryDispatchStore;
pub use sqlite::SqliteDispatchStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::budget::{ChargeOutcome, ResourceEntry};
use crate::error::Result;
use crate::ids::{ResourceId, RunId, TaskId, WorkerId};
use crate::task::{Task, TaskStatus};
use crate::worker::Worker;
use crate::workflow::WorkflowRun;

/// What a charge attempt did, for the caller to announce after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub outcome: ChargeOutcome,
    /// The resource moved into Suspended during this attempt.
    pub newly_suspended: bool,
    /// The task that was parked in AwaitingBudgetApproval by this attempt.
    pub held_task: Option<TaskId>,
}

/// Result of an administrative budget increase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetIncrease {
    pub resource: ResourceEntry,
    /// Tasks moved from AwaitingBudgetApproval back to Pending.
    pub released_tasks: Vec<TaskId>,
}

/// Dispatch store trait - implemented by all storage backends.
#[async_trait]
pub trait DispatchStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    // === Workers ===

    async fn insert_worker(&self, worker: Worker) -> Result<Worker>;

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>>;

    async fn list_workers(&self) -> Result<Vec<Worker>>;

    /// Refresh `last_seen`.
    async fn touch_worker(&self, id: WorkerId, now: DateTime<Utc>) -> Result<Worker>;

    async fn set_worker_active(&self, id: WorkerId, active: bool, now: DateTime<Utc>) -> Result<Worker>;

    // === Tasks ===

    /// Insert a new Pending task. Its run, if any, must be Running and its
    /// parent, if any, must exist.
    async fn insert_task(&self, task: Task) -> Result<Task>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// List tasks, oldest first, optionally filtered by status.
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>>;

    /// Atomically claim the best Pending task the worker qualifies for.
    ///
    /// Ordering is `(priority ordinal, created_at, insertion order)`. Rows held by
    /// another in-flight claim are skipped, never waited on. Returns `Ok(None)`
    /// without touching the worker when nothing is claimable. Inactive workers
    /// get `PreconditionViolation` before any scan.
    async fn claim_next(&self, worker_id: WorkerId, now: DateTime<Utc>) -> Result<Option<Task>>;

    /// Owner-reported Claimed -> Done | Quarantined, releasing the worker.
    async fn finish_task(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Task>;

    /// Owner-reported failure: re-queue or quarantine, releasing the worker.
    async fn record_failure(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Task>;

    // === Budget ledger ===

    /// Insert a resource after checking that its fallback chain is acyclic.
    async fn insert_resource(&self, entry: ResourceEntry) -> Result<ResourceEntry>;

    async fn get_resource(&self, id: ResourceId) -> Result<Option<ResourceEntry>>;

    /// Lock the resource row and attempt the charge.
    ///
    /// With a task: a `Charged` outcome is recorded against the task, and a
    /// `Rejected` outcome parks a Pending task in AwaitingBudgetApproval, in the
    /// same transaction.
    async fn attempt_charge(
        &self,
        resource_id: ResourceId,
        amount_cents: i64,
        task_id: Option<TaskId>,
        now: DateTime<Utc>,
    ) -> Result<ChargeReceipt>;

    /// Park a Pending task in AwaitingBudgetApproval on `resource_id` without a
    /// charge attempt. Returns the task id when it was parked; tasks in any
    /// other state are left unchanged.
    async fn hold_task(&self, task_id: TaskId, resource_id: ResourceId, now: DateTime<Utc>) -> Result<Option<TaskId>>;

    /// Raise the limit, reactivate the resource, and release the tasks waiting on it.
    async fn increase_budget(
        &self,
        resource_id: ResourceId,
        additional_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<BudgetIncrease>;

    // === Workflow runs ===

    async fn insert_run(&self, run: WorkflowRun) -> Result<WorkflowRun>;

    async fn get_run(&self, id: RunId) -> Result<Option<WorkflowRun>>;

    /// Close the run if every task in it is terminal.
    ///
    /// Returns the closed run only to the caller that performed the close;
    /// concurrent or repeated calls get `None`.
    async fn complete_run_if_finished(&self, run_id: RunId, now: DateTime<Utc>) -> Result<Option<WorkflowRun>>;
}

pub type SharedStore = Arc<dyn DispatchStore>;
