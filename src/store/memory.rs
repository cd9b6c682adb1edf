//! In-memory dispatch store (non-persistent).
//!
//! Every row sits behind its own `tokio::sync::Mutex`, which plays the part of
//! a database row lock. Map guards are only held long enough to clone row
//! handles and are never held while waiting on a row.
//!
//! Row lock order: worker -> task, resource -> fallback resource -> task,
//! run -> task. Fallback chains are acyclic (checked on insert), so chained
//! resource locks cannot cycle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use super::{BudgetIncrease, ChargeReceipt, DispatchStore};
use crate::budget::{validate_amount, validate_fallback_chain, ChargeOutcome, ChargeRecord, ResourceEntry};
use crate::error::{DispatchError, Result};
use crate::ids::{ResourceId, RunId, TaskId, WorkerId};
use crate::task::{matches, Task, TaskStatus};
use crate::worker::Worker;
use crate::workflow::{evaluate_completion, RunStatus, WorkflowRun};

type Row<T> = Arc<Mutex<T>>;

struct TaskRow {
    task: Task,
    /// Insertion order, the final claim tie-break.
    seq: u64,
}

struct WorkerRow {
    worker: Worker,
    /// Tasks currently Claimed by this worker.
    claims: usize,
}

struct ResourceSlot {
    /// Copy of the row's immutable fallback link, readable without the row lock.
    fallback_id: Option<ResourceId>,
    row: Row<ResourceEntry>,
}

struct RunRow {
    run: WorkflowRun,
    tasks: Vec<TaskId>,
}

#[derive(Clone, Default)]
pub struct InMemoryDispatchStore {
    tasks: Arc<RwLock<HashMap<TaskId, Row<TaskRow>>>>,
    workers: Arc<RwLock<HashMap<WorkerId, Row<WorkerRow>>>>,
    resources: Arc<RwLock<HashMap<ResourceId, ResourceSlot>>>,
    runs: Arc<RwLock<HashMap<RunId, Row<RunRow>>>>,
    charges: Arc<Mutex<Vec<ChargeRecord>>>,
    next_seq: Arc<AtomicU64>,
}

impl InMemoryDispatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn task_row(&self, id: TaskId) -> Result<Row<TaskRow>> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DispatchError::not_found("task", id))
    }

    async fn worker_row(&self, id: WorkerId) -> Result<Row<WorkerRow>> {
        self.workers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DispatchError::not_found("worker", id))
    }

    async fn resource_row(&self, id: ResourceId) -> Result<Row<ResourceEntry>> {
        self.resources
            .read()
            .await
            .get(&id)
            .map(|slot| Arc::clone(&slot.row))
            .ok_or_else(|| DispatchError::not_found("resource", id))
    }

    async fn run_row(&self, id: RunId) -> Result<Row<RunRow>> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DispatchError::not_found("workflow run", id))
    }

    async fn all_task_rows(&self) -> Vec<Row<TaskRow>> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Shared tail of finish/failure: ownership-checked mutation plus worker release.
    async fn release_claim<F>(&self, task_id: TaskId, worker_id: WorkerId, now: DateTime<Utc>, apply: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()> + Send,
    {
        let worker_row = self.worker_row(worker_id).await?;
        let task_row = self.task_row(task_id).await?;

        let mut worker = worker_row.lock().await;
        let mut row = task_row.lock().await;

        let mut task = row.task.clone();
        apply(&mut task)?;
        task.check_invariants()?;

        row.task = task.clone();
        worker.claims = worker.claims.saturating_sub(1);
        let remaining = worker.claims;
        worker.worker.mark_released(remaining, now);
        Ok(task)
    }
}

#[async_trait]
impl DispatchStore for InMemoryDispatchStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn insert_worker(&self, worker: Worker) -> Result<Worker> {
        let mut workers = self.workers.write().await;
        if workers.contains_key(&worker.id) {
            return Err(DispatchError::precondition(format!(
                "worker {} already registered",
                worker.id
            )));
        }
        workers.insert(
            worker.id,
            Arc::new(Mutex::new(WorkerRow {
                worker: worker.clone(),
                claims: 0,
            })),
        );
        Ok(worker)
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>> {
        match self.worker_row(id).await {
            Ok(row) => Ok(Some(row.lock().await.worker.clone())),
            Err(DispatchError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_workers(&self) -> Result<Vec<Worker>> {
        let rows: Vec<Row<WorkerRow>> = self.workers.read().await.values().cloned().collect();
        let mut workers = Vec::with_capacity(rows.len());
        for row in rows {
            workers.push(row.lock().await.worker.clone());
        }
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workers)
    }

    async fn touch_worker(&self, id: WorkerId, now: DateTime<Utc>) -> Result<Worker> {
        let row = self.worker_row(id).await?;
        let mut row = row.lock().await;
        row.worker.last_seen = now;
        Ok(row.worker.clone())
    }

    async fn set_worker_active(&self, id: WorkerId, active: bool, now: DateTime<Utc>) -> Result<Worker> {
        let row = self.worker_row(id).await?;
        let mut row = row.lock().await;
        row.worker.is_active = active;
        row.worker.last_seen = now;
        Ok(row.worker.clone())
    }

    async fn insert_task(&self, task: Task) -> Result<Task> {
        if task.status != TaskStatus::Pending {
            return Err(DispatchError::precondition("new tasks must start pending"));
        }
        task.check_invariants()?;
        if let Some(parent) = task.parent_task_id {
            if !self.tasks.read().await.contains_key(&parent) {
                return Err(DispatchError::not_found("parent task", parent));
            }
        }

        let row = Arc::new(Mutex::new(TaskRow {
            task: task.clone(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        }));

        // Joining a run happens under the run lock so completion cannot miss it
        let run_row = match task.workflow_run_id {
            Some(run_id) => Some(self.run_row(run_id).await?),
            None => None,
        };
        let mut run_guard = match &run_row {
            Some(run_row) => Some(run_row.lock().await),
            None => None,
        };
        if let Some(run) = &run_guard {
            if run.run.status != RunStatus::Running {
                return Err(DispatchError::precondition(format!(
                    "workflow run {} is already {}",
                    run.run.id, run.run.status
                )));
            }
        }

        {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&task.id) {
                return Err(DispatchError::precondition(format!("task {} already exists", task.id)));
            }
            tasks.insert(task.id, row);
        }
        if let Some(run) = run_guard.as_mut() {
            run.tasks.push(task.id);
        }
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        match self.task_row(id).await {
            Ok(row) => Ok(Some(row.lock().await.task.clone())),
            Err(DispatchError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let mut rows = Vec::new();
        for row in self.all_task_rows().await {
            let row = row.lock().await;
            if status.map_or(true, |s| row.task.status == s) {
                rows.push((row.seq, row.task.clone()));
            }
        }
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, task)| task).collect())
    }

    async fn claim_next(&self, worker_id: WorkerId, now: DateTime<Utc>) -> Result<Option<Task>> {
        let worker_row = self.worker_row(worker_id).await?;
        let mut worker = worker_row.lock().await;
        if !worker.worker.is_active {
            return Err(DispatchError::precondition(format!(
                "worker {} is not active",
                worker_id
            )));
        }

        // Scan without waiting: rows locked by another transaction are skipped
        let mut candidates = Vec::new();
        for row in self.all_task_rows().await {
            let key = {
                let Ok(guard) = row.try_lock() else {
                    continue;
                };
                let eligible = guard.task.status == TaskStatus::Pending
                    && matches(guard.task.required_capabilities.as_ref(), &worker.worker.capabilities);
                eligible.then(|| (guard.task.priority.ordinal(), guard.task.created_at, guard.seq))
            };
            if let Some(key) = key {
                candidates.push((key, row));
            }
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, row) in candidates {
            let Ok(mut guard) = row.try_lock() else {
                continue;
            };
            // Claimed by someone else between the scan and now
            if guard.task.status != TaskStatus::Pending {
                continue;
            }
            let mut task = guard.task.clone();
            task.claim(worker_id, now)?;
            task.check_invariants()?;

            guard.task = task.clone();
            worker.claims += 1;
            worker.worker.mark_claimed(now);
            return Ok(Some(task));
        }
        Ok(None)
    }

    async fn finish_task(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        self.release_claim(task_id, worker_id, now, |task| task.finish(worker_id, status, now))
            .await
    }

    async fn record_failure(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let error = error.to_string();
        self.release_claim(task_id, worker_id, now, move |task| {
            task.record_failure(worker_id, &error, now).map(|_| ())
        })
        .await
    }

    async fn insert_resource(&self, entry: ResourceEntry) -> Result<ResourceEntry> {
        let mut resources = self.resources.write().await;
        if resources.contains_key(&entry.id) {
            return Err(DispatchError::precondition(format!(
                "resource {} already exists",
                entry.id
            )));
        }
        validate_fallback_chain(entry.id, entry.fallback_id, |id| {
            resources.get(&id).map(|slot| slot.fallback_id)
        })?;
        resources.insert(
            entry.id,
            ResourceSlot {
                fallback_id: entry.fallback_id,
                row: Arc::new(Mutex::new(entry.clone())),
            },
        );
        Ok(entry)
    }

    async fn get_resource(&self, id: ResourceId) -> Result<Option<ResourceEntry>> {
        match self.resource_row(id).await {
            Ok(row) => Ok(Some(row.lock().await.clone())),
            Err(DispatchError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn attempt_charge(
        &self,
        resource_id: ResourceId,
        amount_cents: i64,
        task_id: Option<TaskId>,
        now: DateTime<Utc>,
    ) -> Result<ChargeReceipt> {
        validate_amount(amount_cents)?;

        let (row, fallback_row) = {
            let resources = self.resources.read().await;
            let slot = resources
                .get(&resource_id)
                .ok_or_else(|| DispatchError::not_found("resource", resource_id))?;
            let fallback = slot
                .fallback_id
                .and_then(|id| resources.get(&id))
                .map(|f| Arc::clone(&f.row));
            (Arc::clone(&slot.row), fallback)
        };
        let task_row = match task_id {
            Some(id) => Some(self.task_row(id).await?),
            None => None,
        };

        let mut entry = row.lock().await;
        let fallback = match &fallback_row {
            Some(f) => Some(f.lock().await.clone()),
            None => None,
        };

        let mut next = entry.clone();
        let result = next.apply_charge(amount_cents, fallback.as_ref(), now)?;

        let mut held_task = None;
        if let Some(task_row) = &task_row {
            let mut trow = task_row.lock().await;
            match result.outcome {
                ChargeOutcome::Rejected if trow.task.status == TaskStatus::Pending => {
                    let mut task = trow.task.clone();
                    task.hold_for_budget(resource_id, now)?;
                    task.check_invariants()?;
                    held_task = Some(task.id);
                    trow.task = task;
                }
                ChargeOutcome::Charged(_) => {
                    self.charges.lock().await.push(ChargeRecord {
                        resource_id,
                        task_id: Some(trow.task.id),
                        amount_cents,
                        charged_at: now,
                    });
                }
                _ => {}
            }
        } else if let ChargeOutcome::Charged(_) = result.outcome {
            self.charges.lock().await.push(ChargeRecord {
                resource_id,
                task_id: None,
                amount_cents,
                charged_at: now,
            });
        }

        *entry = next;
        Ok(ChargeReceipt {
            outcome: result.outcome,
            newly_suspended: result.newly_suspended,
            held_task,
        })
    }

    async fn hold_task(&self, task_id: TaskId, resource_id: ResourceId, now: DateTime<Utc>) -> Result<Option<TaskId>> {
        if !self.resources.read().await.contains_key(&resource_id) {
            return Err(DispatchError::not_found("resource", resource_id));
        }
        let task_row = self.task_row(task_id).await?;
        let mut trow = task_row.lock().await;
        if trow.task.status != TaskStatus::Pending {
            return Ok(None);
        }
        let mut task = trow.task.clone();
        task.hold_for_budget(resource_id, now)?;
        task.check_invariants()?;
        trow.task = task;
        Ok(Some(task_id))
    }

    async fn increase_budget(
        &self,
        resource_id: ResourceId,
        additional_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<BudgetIncrease> {
        let row = self.resource_row(resource_id).await?;
        let task_rows = self.all_task_rows().await;

        let mut entry = row.lock().await;
        let mut next = entry.clone();
        next.increase_limit(additional_cents, now)?;
        *entry = next.clone();

        let mut released_tasks = Vec::new();
        for task_row in task_rows {
            let mut trow = task_row.lock().await;
            if trow.task.status == TaskStatus::AwaitingBudgetApproval
                && trow.task.awaiting_resource == Some(resource_id)
            {
                trow.task.release_budget_hold(now)?;
                released_tasks.push(trow.task.id);
            }
        }

        Ok(BudgetIncrease {
            resource: next,
            released_tasks,
        })
    }

    async fn insert_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(DispatchError::precondition(format!("workflow run {} already exists", run.id)));
        }
        runs.insert(
            run.id,
            Arc::new(Mutex::new(RunRow {
                run: run.clone(),
                tasks: Vec::new(),
            })),
        );
        Ok(run)
    }

    async fn get_run(&self, id: RunId) -> Result<Option<WorkflowRun>> {
        match self.run_row(id).await {
            Ok(row) => Ok(Some(row.lock().await.run.clone())),
            Err(DispatchError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn complete_run_if_finished(&self, run_id: RunId, now: DateTime<Utc>) -> Result<Option<WorkflowRun>> {
        let run_row = self.run_row(run_id).await?;
        let mut run = run_row.lock().await;
        if run.run.status != RunStatus::Running {
            return Ok(None);
        }

        let rows: Vec<Row<TaskRow>> = {
            let tasks = self.tasks.read().await;
            run.tasks.iter().filter_map(|id| tasks.get(id).cloned()).collect()
        };
        // Terminal states are absorbing, so checking rows one at a time is enough
        let mut statuses = Vec::with_capacity(rows.len());
        for row in rows {
            statuses.push(row.lock().await.task.status);
        }
        let Some(status) = evaluate_completion(statuses) else {
            return Ok(None);
        };

        let members: HashSet<TaskId> = run.tasks.iter().copied().collect();
        let total_cost_cents = self
            .charges
            .lock()
            .await
            .iter()
            .filter(|c| c.task_id.is_some_and(|t| members.contains(&t)))
            .map(|c| c.amount_cents)
            .sum();

        let mut closed = run.run.clone();
        closed.finish(status, total_cost_cents, now)?;
        run.run = closed.clone();
        Ok(Some(closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{NewResource, ResourceStatus};
    use crate::task::{NewTask, Priority};
    use crate::worker::WorkerStatus;

    async fn worker(store: &InMemoryDispatchStore, caps: &[&str]) -> Worker {
        store
            .insert_worker(Worker::new("w", caps.iter().copied(), Utc::now()))
            .await
            .unwrap()
    }

    async fn task(store: &InMemoryDispatchStore, new: NewTask) -> Task {
        store
            .insert_task(Task::create(new, 3, Utc::now()).unwrap())
            .await
            .unwrap()
    }

    async fn resource(store: &InMemoryDispatchStore, limit: i64, fallback: Option<ResourceId>) -> ResourceEntry {
        let entry = ResourceEntry::create(
            NewResource {
                name: "svc".into(),
                budget_limit_cents: limit,
                fallback_id: fallback,
            },
            Utc::now(),
        )
        .unwrap();
        store.insert_resource(entry).await.unwrap()
    }

    #[tokio::test]
    async fn test_claim_respects_priority_then_age() {
        let store = InMemoryDispatchStore::new();
        let critical = task(&store, NewTask::new("a", Priority::Critical)).await;
        let low = task(&store, NewTask::new("b", Priority::Low)).await;
        let high = task(&store, NewTask::new("c", Priority::High)).await;

        let mut order = Vec::new();
        for _ in 0..3 {
            let w = worker(&store, &[]).await;
            order.push(store.claim_next(w.id, Utc::now()).await.unwrap().unwrap().id);
        }
        assert_eq!(order, vec![critical.id, high.id, low.id]);
    }

    #[tokio::test]
    async fn test_claim_skips_unqualified_and_marks_worker_busy() {
        let store = InMemoryDispatchStore::new();
        task(&store, NewTask::new("gpu job", Priority::Critical).with_capabilities(["gpu"])).await;
        let plain = task(&store, NewTask::new("plain", Priority::Low)).await;
        let w = worker(&store, &["rust"]).await;

        let claimed = store.claim_next(w.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, plain.id);
        assert_eq!(claimed.assigned_worker, Some(w.id));

        let w = store.get_worker(w.id).await.unwrap().unwrap();
        assert_eq!(w.status, WorkerStatus::Busy);

        // Only the gpu task is left and this worker cannot take it
        assert!(store.claim_next(w.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inactive_worker_is_rejected() {
        let store = InMemoryDispatchStore::new();
        task(&store, NewTask::new("t", Priority::Low)).await;
        let w = worker(&store, &[]).await;
        store.set_worker_active(w.id, false, Utc::now()).await.unwrap();

        assert!(matches!(
            store.claim_next(w.id, Utc::now()).await,
            Err(DispatchError::PreconditionViolation(_))
        ));
        assert_eq!(store.list_tasks(Some(TaskStatus::Pending)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_skip_locked_row_is_not_waited_on() {
        let store = InMemoryDispatchStore::new();
        let first = task(&store, NewTask::new("first", Priority::Critical)).await;
        let second = task(&store, NewTask::new("second", Priority::Low)).await;
        let w = worker(&store, &[]).await;

        // Simulate another transaction holding the best candidate
        let held = store.task_row(first.id).await.unwrap();
        let guard = held.lock().await;

        let claimed = store.claim_next(w.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
        drop(guard);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_share_a_task() {
        let store = InMemoryDispatchStore::new();
        for i in 0..10 {
            task(&store, NewTask::new(format!("t{}", i), Priority::Medium)).await;
        }
        let mut handles = Vec::new();
        for _ in 0..32 {
            let w = worker(&store, &[]).await;
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_next(w.id, Utc::now()).await.unwrap()
            }));
        }

        let claimed: Vec<Task> = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter_map(|r| r.unwrap())
            .collect();
        let unique: HashSet<TaskId> = claimed.iter().map(|t| t.id).collect();
        assert_eq!(unique.len(), claimed.len());
        assert!(claimed.len() <= 10);

        for t in store.list_tasks(Some(TaskStatus::Claimed)).await.unwrap() {
            assert_eq!(
                claimed.iter().filter(|c| c.id == t.id).count(),
                1,
                "claimed task {} must have exactly one owner",
                t.id
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_charges_never_overspend() {
        let store = InMemoryDispatchStore::new();
        let r = resource(&store, 100, None).await;

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.attempt_charge(r.id, 7, None, Utc::now()).await.unwrap() })
            })
            .collect();
        let charged = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| matches!(r.as_ref().unwrap().outcome, ChargeOutcome::Charged(_)))
            .count() as i64;

        assert_eq!(charged, 14);
        let r = store.get_resource(r.id).await.unwrap().unwrap();
        assert_eq!(r.current_usage_cents, charged * 7);
        assert_eq!(r.status, ResourceStatus::Suspended);
    }

    #[tokio::test]
    async fn test_rejected_charge_parks_task_until_increase() {
        let store = InMemoryDispatchStore::new();
        let r = resource(&store, 5, None).await;
        let t = task(&store, NewTask::new("costly", Priority::High)).await;

        let receipt = store.attempt_charge(r.id, 10, Some(t.id), Utc::now()).await.unwrap();
        assert_eq!(receipt.outcome, ChargeOutcome::Rejected);
        assert!(receipt.newly_suspended);
        assert_eq!(receipt.held_task, Some(t.id));
        let parked = store.get_task(t.id).await.unwrap().unwrap();
        assert_eq!(parked.status, TaskStatus::AwaitingBudgetApproval);

        // Parked tasks are not claimable
        let w = worker(&store, &[]).await;
        assert!(store.claim_next(w.id, Utc::now()).await.unwrap().is_none());

        let increase = store.increase_budget(r.id, 100, Utc::now()).await.unwrap();
        assert_eq!(increase.resource.status, ResourceStatus::Active);
        assert_eq!(increase.released_tasks, vec![t.id]);
        assert_eq!(
            store.get_task(t.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_cyclic_fallback_is_refused() {
        let store = InMemoryDispatchStore::new();
        let b = resource(&store, 10, None).await;
        let mut self_loop = ResourceEntry::create(
            NewResource {
                name: "loop".into(),
                budget_limit_cents: 10,
                fallback_id: None,
            },
            Utc::now(),
        )
        .unwrap();
        self_loop.fallback_id = Some(self_loop.id);
        assert!(store.insert_resource(self_loop).await.is_err());

        let missing = ResourceId::new();
        assert!(resource_with_fallback(&store, missing).await.is_err());
        assert!(resource_with_fallback(&store, b.id).await.is_ok());
    }

    async fn resource_with_fallback(store: &InMemoryDispatchStore, fallback: ResourceId) -> Result<ResourceEntry> {
        let entry = ResourceEntry::create(
            NewResource {
                name: "primary".into(),
                budget_limit_cents: 0,
                fallback_id: Some(fallback),
            },
            Utc::now(),
        )?;
        store.insert_resource(entry).await
    }

    #[tokio::test]
    async fn test_run_completes_once_with_cost() {
        let store = InMemoryDispatchStore::new();
        let run = store.insert_run(WorkflowRun::start("deploy", Utc::now()).unwrap()).await.unwrap();
        let r = resource(&store, 1_000, None).await;
        let a = task(&store, NewTask::new("a", Priority::High).in_run(run.id)).await;
        let b = task(&store, NewTask::new("b", Priority::High).in_run(run.id)).await;
        store.attempt_charge(r.id, 30, Some(a.id), Utc::now()).await.unwrap();
        store.attempt_charge(r.id, 12, Some(b.id), Utc::now()).await.unwrap();
        store.attempt_charge(r.id, 99, None, Utc::now()).await.unwrap();

        let w = worker(&store, &[]).await;
        for _ in 0..2 {
            let t = store.claim_next(w.id, Utc::now()).await.unwrap().unwrap();
            assert!(t.id == a.id || t.id == b.id);
            store.finish_task(t.id, w.id, TaskStatus::Done, Utc::now()).await.unwrap();
        }
        assert_eq!(
            store.get_worker(w.id).await.unwrap().unwrap().status,
            WorkerStatus::Idle
        );

        let closed = store.complete_run_if_finished(run.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(closed.status, RunStatus::Completed);
        assert_eq!(closed.total_cost_cents, 42);
        assert!(closed.end_time.is_some());
        assert!(store.complete_run_if_finished(run.id, Utc::now()).await.unwrap().is_none());

        // Closed runs accept no new tasks
        let late = Task::create(NewTask::new("late", Priority::Low).in_run(run.id), 3, Utc::now()).unwrap();
        assert!(store.insert_task(late).await.is_err());
    }
}
