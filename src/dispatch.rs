//! Dispatch facade - the operations callers use.
//!
//! The facade holds no state of its own between calls: everything lives in
//! the [`DispatchStore`](crate::store::DispatchStore), so any number of
//! dispatchers may share one store. Each operation is one store transaction
//! followed by best-effort announcements (events, queue) that run only after
//! the transaction returned.
//!
//! # External operations
//! - [`Dispatcher::create_task`]
//! - [`Dispatcher::claim_next`]
//! - [`Dispatcher::update_status`]
//! - [`Dispatcher::report_failure`]
//! - [`Dispatcher::attempt_charge_and_dispatch`]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;

use crate::budget::{validate_amount, ChargeOutcome, NewResource, ResourceEntry};
use crate::config::DispatchSettings;
use crate::error::{DispatchError, Result};
use crate::events::{DispatchEvent, EventBus};
use crate::ids::{ResourceId, RunId, TaskId, WorkerId};
use crate::queue::SharedQueue;
use crate::store::{BudgetIncrease, SharedStore};
use crate::task::{matches, rank_workers, NewTask, Task, TaskStatus};
use crate::worker::Worker;
use crate::workflow::WorkflowRun;

/// Wall clock at the precision the stores keep.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Advisory pick for a task, see [`Dispatcher::best_worker_for`].
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecommendation {
    pub worker: Worker,
    /// Fraction of the task's required capabilities this worker offers.
    pub coverage: f64,
    pub matched: usize,
    /// Whether the worker could actually claim the task.
    pub eligible: bool,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: SharedStore,
    events: EventBus,
    queue: Option<SharedQueue>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(store: SharedStore, events: EventBus, settings: DispatchSettings) -> Self {
        Self {
            store,
            events,
            queue: None,
            settings,
        }
    }

    /// Attach a queue collaborator for push notification of claimable tasks.
    pub fn with_queue(mut self, queue: SharedQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_persistent()
    }

    /// Hand a task id to the queue without waiting on it.
    fn announce(&self, task_id: TaskId, delay: Option<Duration>) {
        let Some(queue) = &self.queue else {
            return;
        };
        let queue = Arc::clone(queue);
        tokio::spawn(async move {
            let published = match delay {
                Some(delay) => queue.publish_delayed(task_id, delay).await,
                None => queue.publish(task_id).await,
            };
            if let Err(e) = published {
                tracing::warn!("Failed to queue task {}: {}", task_id, e);
            }
        });
    }

    async fn require_task(&self, id: TaskId) -> Result<Task> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("task", id))
    }

    // === Tasks ===

    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        let task = Task::create(new, self.settings.default_max_retries, now())?;
        let task = self.store.insert_task(task).await?;

        tracing::info!(
            task_id = %task.id,
            priority = %task.priority,
            "Task created: {}",
            task.title
        );
        self.events.publish(DispatchEvent::TaskCreated {
            task_id: task.id,
            priority: task.priority,
        });
        self.announce(task.id, None);
        Ok(task)
    }

    /// Create a successor of `parent_id`. The child joins the parent's run
    /// unless it names one itself.
    pub async fn create_subtask(&self, parent_id: TaskId, mut new: NewTask) -> Result<Task> {
        let parent = self.require_task(parent_id).await?;
        new.parent_task_id = Some(parent.id);
        if new.workflow_run_id.is_none() {
            new.workflow_run_id = parent.workflow_run_id;
        }
        self.create_task(new).await
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.require_task(id).await
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        self.store.list_tasks(status).await
    }

    /// Claim the best task for `worker_id`. `Ok(None)` means nothing is
    /// claimable right now (including under contention); poll again later.
    pub async fn claim_next(&self, worker_id: WorkerId) -> Result<Option<Task>> {
        let claimed = self.store.claim_next(worker_id, now()).await?;
        match &claimed {
            Some(task) => {
                tracing::info!(task_id = %task.id, worker_id = %worker_id, "Task claimed");
                self.events.publish(DispatchEvent::TaskClaimed {
                    task_id: task.id,
                    worker_id,
                });
            }
            None => tracing::debug!(worker_id = %worker_id, "No claimable task"),
        }
        Ok(claimed)
    }

    /// Owner-reported completion. Only `Done` and `Quarantined` are accepted.
    pub async fn update_status(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        status: TaskStatus,
    ) -> Result<Task> {
        if !status.is_terminal() {
            return Err(DispatchError::precondition(format!(
                "status updates only accept done or quarantined, got {}",
                status
            )));
        }
        let task = self
            .store
            .finish_task(task_id, worker_id, status, now())
            .await?;

        tracing::info!(task_id = %task.id, worker_id = %worker_id, "Task {}", task.status);
        if task.status == TaskStatus::Quarantined {
            self.events.publish(DispatchEvent::TaskQuarantined {
                task_id: task.id,
                last_error: task.last_error.clone(),
            });
        }
        self.complete_run_for(&task).await;
        Ok(task)
    }

    /// Owner-reported failure: re-queue while retries remain, else quarantine.
    pub async fn report_failure(&self, task_id: TaskId, worker_id: WorkerId, error: &str) -> Result<Task> {
        let task = self
            .store
            .record_failure(task_id, worker_id, error, now())
            .await?;

        match task.status {
            TaskStatus::Pending => {
                let delay = self.settings.backoff.delay_for(task.retry_count);
                tracing::warn!(
                    task_id = %task.id,
                    retry = task.retry_count,
                    max_retries = task.max_retries,
                    "Task failed, re-queued with {:?} backoff: {}",
                    delay,
                    error
                );
                self.events.publish(DispatchEvent::TaskRequeued {
                    task_id: task.id,
                    retry_count: task.retry_count,
                    delay,
                });
                self.announce(task.id, Some(delay));
            }
            TaskStatus::Quarantined => {
                tracing::error!(
                    task_id = %task.id,
                    retries = task.retry_count,
                    "Task quarantined after exhausting retries: {}",
                    error
                );
                self.events.publish(DispatchEvent::TaskQuarantined {
                    task_id: task.id,
                    last_error: task.last_error.clone(),
                });
                self.complete_run_for(&task).await;
            }
            _ => {}
        }
        Ok(task)
    }

    /// Re-run the completion check for a task's workflow run.
    ///
    /// Called after every terminal transition; safe to call again at any time.
    /// Returns the run only to the call that closed it.
    pub async fn on_task_terminal(&self, task_id: TaskId) -> Result<Option<WorkflowRun>> {
        let task = self.require_task(task_id).await?;
        if !task.status.is_terminal() {
            return Ok(None);
        }
        let Some(run_id) = task.workflow_run_id else {
            return Ok(None);
        };

        let closed = self.store.complete_run_if_finished(run_id, now()).await?;
        if let Some(run) = &closed {
            tracing::info!(
                run_id = %run.id,
                status = %run.status,
                cost_cents = run.total_cost_cents,
                "Workflow run finished"
            );
            self.events.publish(DispatchEvent::WorkflowCompleted {
                run_id: run.id,
                status: run.status,
            });
        }
        Ok(closed)
    }

    /// The task's transition is already committed; a failed run check is
    /// logged and can be retried through [`Dispatcher::on_task_terminal`].
    async fn complete_run_for(&self, task: &Task) {
        if task.workflow_run_id.is_none() {
            return;
        }
        if let Err(e) = self.on_task_terminal(task.id).await {
            tracing::error!(task_id = %task.id, "Workflow completion check failed: {}", e);
        }
    }

    /// Advisory: the active worker that best covers the task's requirements.
    pub async fn best_worker_for(&self, task_id: TaskId) -> Result<Option<WorkerRecommendation>> {
        let task = self.require_task(task_id).await?;
        let workers = self.store.list_workers().await?;
        let required = task.required_capabilities.as_ref();

        Ok(rank_workers(required, &workers)
            .into_iter()
            .next()
            .map(|fit| WorkerRecommendation {
                eligible: matches(required, &fit.worker.capabilities),
                worker: fit.worker.clone(),
                coverage: fit.coverage,
                matched: fit.matched,
            }))
    }

    // === Budget ===

    /// Attempt one charge. On `Substituted` nothing was charged and the caller
    /// retries against the named fallback.
    pub async fn attempt_charge_and_dispatch(
        &self,
        resource_id: ResourceId,
        amount_cents: i64,
        task_id: Option<TaskId>,
    ) -> Result<ChargeOutcome> {
        validate_amount(amount_cents)?;
        let receipt = self
            .store
            .attempt_charge(resource_id, amount_cents, task_id, now())
            .await?;

        if receipt.newly_suspended {
            tracing::warn!(resource_id = %resource_id, "Resource suspended: over budget");
            self.events
                .publish(DispatchEvent::ResourceSuspended { resource_id });
        }
        if let Some(held) = receipt.held_task {
            tracing::warn!(
                task_id = %held,
                resource_id = %resource_id,
                "Task awaiting budget approval"
            );
        }
        tracing::debug!(
            resource_id = %resource_id,
            amount_cents,
            outcome = ?receipt.outcome,
            "Charge attempted"
        );
        Ok(receipt.outcome)
    }

    /// Follow `Substituted` answers hop by hop until a charge lands or is
    /// rejected. Stops after `max_fallback_hops` hops or on a revisited resource;
    /// giving up parks a Pending task on the last resource tried, the same way a
    /// rejected charge does.
    pub async fn charge_following_fallbacks(
        &self,
        resource_id: ResourceId,
        amount_cents: i64,
        task_id: Option<TaskId>,
    ) -> Result<ChargeOutcome> {
        let mut current = resource_id;
        let mut visited = HashSet::from([resource_id]);
        let mut hops = 0;

        loop {
            let next = match self
                .attempt_charge_and_dispatch(current, amount_cents, task_id)
                .await?
            {
                ChargeOutcome::Substituted(next) => next,
                outcome => return Ok(outcome),
            };
            if !visited.insert(next) {
                tracing::warn!(resource_id = %next, "Fallback chain revisits a resource");
                break;
            }
            if hops == self.settings.max_fallback_hops {
                tracing::warn!(
                    resource_id = %resource_id,
                    hops,
                    "Gave up following fallbacks"
                );
                break;
            }
            hops += 1;
            current = next;
        }

        if let Some(task_id) = task_id {
            if let Some(held) = self.store.hold_task(task_id, current, now()).await? {
                tracing::warn!(
                    task_id = %held,
                    resource_id = %current,
                    "Task awaiting budget approval"
                );
            }
        }
        Ok(ChargeOutcome::Rejected)
    }

    pub async fn register_resource(&self, new: NewResource) -> Result<ResourceEntry> {
        let entry = ResourceEntry::create(new, now())?;
        let entry = self.store.insert_resource(entry).await?;
        tracing::info!(
            resource_id = %entry.id,
            limit_cents = entry.budget_limit_cents,
            "Resource registered: {}",
            entry.name
        );
        Ok(entry)
    }

    pub async fn get_resource(&self, id: ResourceId) -> Result<ResourceEntry> {
        self.store
            .get_resource(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("resource", id))
    }

    /// Administrative increase. Tasks parked on this resource go back to Pending.
    pub async fn increase_budget(&self, resource_id: ResourceId, additional_cents: i64) -> Result<BudgetIncrease> {
        let increase = self
            .store
            .increase_budget(resource_id, additional_cents, now())
            .await?;
        tracing::info!(
            resource_id = %resource_id,
            limit_cents = increase.resource.budget_limit_cents,
            released = increase.released_tasks.len(),
            "Budget increased"
        );
        for task_id in &increase.released_tasks {
            self.announce(*task_id, None);
        }
        Ok(increase)
    }

    // === Workers ===

    pub async fn register_worker<I, S>(&self, name: &str, capabilities: I) -> Result<Worker>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.trim();
        if name.is_empty() {
            return Err(DispatchError::precondition("worker name must not be empty"));
        }
        let worker = Worker::new(name, capabilities, now());
        if worker.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(DispatchError::precondition("capability tags must not be blank"));
        }
        let worker = self.store.insert_worker(worker).await?;
        tracing::info!(worker_id = %worker.id, "Worker registered: {}", worker.name);
        Ok(worker)
    }

    pub async fn heartbeat(&self, worker_id: WorkerId) -> Result<Worker> {
        self.store.touch_worker(worker_id, now()).await
    }

    pub async fn set_worker_active(&self, worker_id: WorkerId, active: bool) -> Result<Worker> {
        let worker = self
            .store
            .set_worker_active(worker_id, active, now())
            .await?;
        tracing::info!(worker_id = %worker_id, active, "Worker activity changed");
        Ok(worker)
    }

    pub async fn get_worker(&self, id: WorkerId) -> Result<Worker> {
        self.store
            .get_worker(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("worker", id))
    }

    pub async fn list_workers(&self) -> Result<Vec<Worker>> {
        self.store.list_workers().await
    }

    // === Workflow runs ===

    pub async fn create_workflow_run(&self, template: &str) -> Result<WorkflowRun> {
        let run = WorkflowRun::start(template, now())?;
        let run = self.store.insert_run(run).await?;
        tracing::info!(run_id = %run.id, "Workflow run started: {}", run.template);
        Ok(run)
    }

    pub async fn get_workflow_run(&self, id: RunId) -> Result<WorkflowRun> {
        self.store
            .get_run(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("workflow run", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::ResourceStatus;
    use crate::queue::InMemoryTaskQueue;
    use crate::store::{InMemoryDispatchStore, SqliteDispatchStore};
    use crate::task::Priority;
    use crate::worker::WorkerStatus;
    use crate::workflow::RunStatus;
    use tokio::sync::broadcast;

    fn memory_dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(InMemoryDispatchStore::new()),
            EventBus::new(256),
            DispatchSettings::default(),
        )
    }

    /// One dispatcher per backend.
    async fn dispatchers() -> Vec<Dispatcher> {
        dispatchers_with(DispatchSettings::default()).await
    }

    async fn dispatchers_with(settings: DispatchSettings) -> Vec<Dispatcher> {
        let sqlite = SqliteDispatchStore::open_in_memory().await.unwrap();
        vec![
            Dispatcher::new(Arc::new(InMemoryDispatchStore::new()), EventBus::new(256), settings.clone()),
            Dispatcher::new(Arc::new(sqlite), EventBus::new(256), settings),
        ]
    }

    fn drain(rx: &mut broadcast::Receiver<DispatchEvent>) -> Vec<DispatchEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn resource(limit: i64, fallback: Option<ResourceId>) -> NewResource {
        NewResource {
            name: "llm".into(),
            budget_limit_cents: limit,
            fallback_id: fallback,
        }
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        for d in dispatchers().await {
            let critical = d.create_task(NewTask::new("c", Priority::Critical)).await.unwrap();
            let low = d.create_task(NewTask::new("l", Priority::Low)).await.unwrap();
            let high = d.create_task(NewTask::new("h", Priority::High)).await.unwrap();

            let mut order = Vec::new();
            for i in 0..3 {
                let w = d.register_worker(&format!("w{}", i), Vec::<String>::new()).await.unwrap();
                order.push(d.claim_next(w.id).await.unwrap().unwrap().id);
            }
            assert_eq!(order, vec![critical.id, high.id, low.id]);
        }
    }

    #[tokio::test]
    async fn test_capability_soundness() {
        for d in dispatchers().await {
            d.create_task(NewTask::new("needs both", Priority::Critical).with_capabilities(["rust", "gpu"]))
                .await
                .unwrap();
            let rusty = d.register_worker("rusty", ["rust"]).await.unwrap();
            assert!(d.claim_next(rusty.id).await.unwrap().is_none());
            assert_eq!(d.get_worker(rusty.id).await.unwrap().status, WorkerStatus::Idle);

            let full = d.register_worker("full", ["rust", "gpu", "sql"]).await.unwrap();
            let task = d.claim_next(full.id).await.unwrap().unwrap();
            assert!(task
                .required_capabilities
                .unwrap()
                .iter()
                .all(|c| full.capabilities.contains(c)));
        }
    }

    #[tokio::test]
    async fn test_inactive_worker_cannot_claim() {
        for d in dispatchers().await {
            d.create_task(NewTask::new("t", Priority::Low)).await.unwrap();
            let w = d.register_worker("sleepy", ["x"]).await.unwrap();
            d.set_worker_active(w.id, false).await.unwrap();
            assert!(matches!(
                d.claim_next(w.id).await,
                Err(DispatchError::PreconditionViolation(_))
            ));

            d.set_worker_active(w.id, true).await.unwrap();
            assert!(d.claim_next(w.id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_fallback_chaining() {
        for d in dispatchers().await {
            let mut rx = d.events().subscribe();
            let b = d.register_resource(resource(100, None)).await.unwrap();
            let a = d.register_resource(resource(0, Some(b.id))).await.unwrap();

            let outcome = d.attempt_charge_and_dispatch(a.id, 10, None).await.unwrap();
            assert_eq!(outcome, ChargeOutcome::Substituted(b.id));
            let outcome = d.attempt_charge_and_dispatch(b.id, 10, None).await.unwrap();
            assert_eq!(outcome, ChargeOutcome::Charged(b.id));

            assert_eq!(d.get_resource(b.id).await.unwrap().current_usage_cents, 10);
            let a = d.get_resource(a.id).await.unwrap();
            assert_eq!(a.status, ResourceStatus::Suspended);
            assert_eq!(a.current_usage_cents, 0);

            let suspended: Vec<_> = drain(&mut rx)
                .into_iter()
                .filter(|e| matches!(e, DispatchEvent::ResourceSuspended { .. }))
                .collect();
            assert_eq!(suspended, vec![DispatchEvent::ResourceSuspended { resource_id: a.id }]);
        }
    }

    #[tokio::test]
    async fn test_following_fallbacks_is_bounded() {
        let d = Dispatcher::new(
            Arc::new(InMemoryDispatchStore::new()),
            EventBus::default(),
            DispatchSettings {
                max_fallback_hops: 1,
                ..DispatchSettings::default()
            },
        );
        let c = d.register_resource(resource(100, None)).await.unwrap();
        let b = d.register_resource(resource(0, Some(c.id))).await.unwrap();
        let a = d.register_resource(resource(0, Some(b.id))).await.unwrap();

        // One hop reaches b, which is over budget too
        let outcome = d.charge_following_fallbacks(a.id, 5, None).await.unwrap();
        assert_eq!(outcome, ChargeOutcome::Rejected);
        assert_eq!(d.get_resource(c.id).await.unwrap().current_usage_cents, 0);

        // Starting one hop further lands on c
        let outcome = d.charge_following_fallbacks(b.id, 5, None).await.unwrap();
        assert_eq!(outcome, ChargeOutcome::Charged(c.id));
        assert_eq!(d.get_resource(c.id).await.unwrap().current_usage_cents, 5);
    }

    #[tokio::test]
    async fn test_giving_up_on_fallbacks_parks_the_task() {
        let settings = DispatchSettings {
            max_fallback_hops: 1,
            ..DispatchSettings::default()
        };
        for d in dispatchers_with(settings).await {
            let c = d.register_resource(resource(100, None)).await.unwrap();
            let b = d.register_resource(resource(0, Some(c.id))).await.unwrap();
            let a = d.register_resource(resource(0, Some(b.id))).await.unwrap();
            let task = d.create_task(NewTask::new("summarise", Priority::Medium)).await.unwrap();

            let outcome = d.charge_following_fallbacks(a.id, 5, Some(task.id)).await.unwrap();
            assert_eq!(outcome, ChargeOutcome::Rejected);

            let parked = d.get_task(task.id).await.unwrap();
            assert_eq!(parked.status, TaskStatus::AwaitingBudgetApproval);
            assert_eq!(parked.awaiting_resource, Some(b.id));
            assert_eq!(d.get_resource(c.id).await.unwrap().current_usage_cents, 0);

            let increase = d.increase_budget(b.id, 50).await.unwrap();
            assert_eq!(increase.released_tasks, vec![task.id]);
            assert_eq!(d.get_task(task.id).await.unwrap().status, TaskStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_created_task_matches_stored_row() {
        for d in dispatchers().await {
            let task = d.create_task(NewTask::new("index", Priority::High)).await.unwrap();
            assert_eq!(d.get_task(task.id).await.unwrap(), task);
        }
    }

    #[tokio::test]
    async fn test_negative_charge_is_precondition_violation() {
        let d = memory_dispatcher();
        let r = d.register_resource(resource(100, None)).await.unwrap();
        assert!(matches!(
            d.attempt_charge_and_dispatch(r.id, -10, None).await,
            Err(DispatchError::PreconditionViolation(_))
        ));
        assert_eq!(d.get_resource(r.id).await.unwrap().current_usage_cents, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_budget_conservation() {
        for d in dispatchers().await {
            let r = d.register_resource(resource(95, None)).await.unwrap();
            let handles: Vec<_> = (0..40)
                .map(|_| {
                    let d = d.clone();
                    tokio::spawn(async move { d.attempt_charge_and_dispatch(r.id, 10, None).await.unwrap() })
                })
                .collect();
            let charged = futures::future::join_all(handles)
                .await
                .into_iter()
                .filter(|o| matches!(o, Ok(ChargeOutcome::Charged(_))))
                .count() as i64;

            assert!(charged * 10 <= 95);
            assert_eq!(charged, 9);
            assert_eq!(d.get_resource(r.id).await.unwrap().current_usage_cents, charged * 10);
        }
    }

    #[tokio::test]
    async fn test_rejected_charge_parks_task_until_budget_increase() {
        for d in dispatchers().await {
            let r = d.register_resource(resource(5, None)).await.unwrap();
            let t = d.create_task(NewTask::new("expensive", Priority::High)).await.unwrap();

            let outcome = d.attempt_charge_and_dispatch(r.id, 50, Some(t.id)).await.unwrap();
            assert_eq!(outcome, ChargeOutcome::Rejected);
            let parked = d.get_task(t.id).await.unwrap();
            assert_eq!(parked.status, TaskStatus::AwaitingBudgetApproval);
            assert_eq!(
                d.list_tasks(Some(TaskStatus::AwaitingBudgetApproval)).await.unwrap().len(),
                1
            );

            // A zero increase adds no budget and releases nothing
            assert!(matches!(
                d.increase_budget(r.id, 0).await,
                Err(DispatchError::PreconditionViolation(_))
            ));
            let unchanged = d.get_resource(r.id).await.unwrap();
            assert_eq!(unchanged.status, ResourceStatus::Suspended);
            assert_eq!(unchanged.budget_limit_cents, 5);
            assert_eq!(d.get_task(t.id).await.unwrap().status, TaskStatus::AwaitingBudgetApproval);

            let increase = d.increase_budget(r.id, 100).await.unwrap();
            assert_eq!(increase.released_tasks, vec![t.id]);
            assert_eq!(d.get_task(t.id).await.unwrap().status, TaskStatus::Pending);

            let outcome = d.attempt_charge_and_dispatch(r.id, 50, Some(t.id)).await.unwrap();
            assert_eq!(outcome, ChargeOutcome::Charged(r.id));
        }
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        for d in dispatchers().await {
            let mut rx = d.events().subscribe();
            let t = d
                .create_task(NewTask::new("flaky", Priority::Medium).with_max_retries(3))
                .await
                .unwrap();
            let w = d.register_worker("w", ["any"]).await.unwrap();

            let mut statuses = Vec::new();
            for attempt in 1..=3 {
                let claimed = d.claim_next(w.id).await.unwrap().unwrap();
                assert_eq!(claimed.id, t.id);
                let after = d.report_failure(t.id, w.id, &format!("attempt {}", attempt)).await.unwrap();
                statuses.push(after.status);
            }
            assert_eq!(
                statuses,
                vec![TaskStatus::Pending, TaskStatus::Pending, TaskStatus::Quarantined]
            );

            let t = d.get_task(t.id).await.unwrap();
            assert_eq!(t.retry_count, 3);
            assert_eq!(t.last_error.as_deref(), Some("attempt 3"));
            assert_eq!(t.priority, Priority::Medium);
            assert_eq!(d.get_worker(w.id).await.unwrap().status, WorkerStatus::Idle);
            assert!(d.claim_next(w.id).await.unwrap().is_none());

            let events = drain(&mut rx);
            let requeued = events
                .iter()
                .filter(|e| matches!(e, DispatchEvent::TaskRequeued { .. }))
                .count();
            assert_eq!(requeued, 2);
            assert!(events.contains(&DispatchEvent::TaskQuarantined {
                task_id: t.id,
                last_error: Some("attempt 3".to_string()),
            }));
        }
    }

    #[tokio::test]
    async fn test_ownership_rejection_leaves_task_unchanged() {
        for d in dispatchers().await {
            d.create_task(NewTask::new("mine", Priority::High)).await.unwrap();
            let owner = d.register_worker("owner", Vec::<String>::new()).await.unwrap();
            let intruder = d.register_worker("intruder", Vec::<String>::new()).await.unwrap();
            let claimed = d.claim_next(owner.id).await.unwrap().unwrap();

            assert!(matches!(
                d.report_failure(claimed.id, intruder.id, "not yours").await,
                Err(DispatchError::OwnershipViolation { .. })
            ));
            assert!(matches!(
                d.update_status(claimed.id, intruder.id, TaskStatus::Done).await,
                Err(DispatchError::OwnershipViolation { .. })
            ));
            let after = d.get_task(claimed.id).await.unwrap();
            assert_eq!(after.status, TaskStatus::Claimed);
            assert_eq!(after.assigned_worker, Some(owner.id));
            assert_eq!(after.retry_count, 0);
            assert_eq!(after.last_error, None);

            // Late report after a completion is rejected too
            d.update_status(claimed.id, owner.id, TaskStatus::Done).await.unwrap();
            assert!(matches!(
                d.report_failure(claimed.id, owner.id, "late").await,
                Err(DispatchError::OwnershipViolation { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_update_status_accepts_only_terminal_targets() {
        let d = memory_dispatcher();
        d.create_task(NewTask::new("t", Priority::Low)).await.unwrap();
        let w = d.register_worker("w", Vec::<String>::new()).await.unwrap();
        let t = d.claim_next(w.id).await.unwrap().unwrap();

        assert!(matches!(
            d.update_status(t.id, w.id, TaskStatus::Pending).await,
            Err(DispatchError::PreconditionViolation(_))
        ));
        let done = d.update_status(t.id, w.id, TaskStatus::Done).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.assigned_worker, None);
    }

    #[tokio::test]
    async fn test_workflow_completes_exactly_once() {
        for d in dispatchers().await {
            let mut rx = d.events().subscribe();
            let run = d.create_workflow_run("release").await.unwrap();
            let first = d.create_task(NewTask::new("build", Priority::High).in_run(run.id)).await.unwrap();
            let second = d
                .create_subtask(first.id, NewTask::new("publish", Priority::High))
                .await
                .unwrap();
            assert_eq!(second.workflow_run_id, Some(run.id));
            assert_eq!(second.parent_task_id, Some(first.id));

            let w1 = d.register_worker("w1", Vec::<String>::new()).await.unwrap();
            let w2 = d.register_worker("w2", Vec::<String>::new()).await.unwrap();
            let t1 = d.claim_next(w1.id).await.unwrap().unwrap();
            let t2 = d.claim_next(w2.id).await.unwrap().unwrap();

            // Finish in reverse claim order
            d.update_status(t2.id, w2.id, TaskStatus::Done).await.unwrap();
            assert_eq!(d.get_workflow_run(run.id).await.unwrap().status, RunStatus::Running);
            d.update_status(t1.id, w1.id, TaskStatus::Done).await.unwrap();

            let run = d.get_workflow_run(run.id).await.unwrap();
            assert_eq!(run.status, RunStatus::Completed);
            assert!(run.end_time.is_some());

            // Re-checking never completes twice
            assert!(d.on_task_terminal(t1.id).await.unwrap().is_none());
            let completions = drain(&mut rx)
                .into_iter()
                .filter(|e| matches!(e, DispatchEvent::WorkflowCompleted { .. }))
                .count();
            assert_eq!(completions, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sibling_completion_closes_run_once() {
        for d in dispatchers().await {
            let mut rx = d.events().subscribe();
            let run = d.create_workflow_run("fan-out").await.unwrap();
            let mut claims = Vec::new();
            for i in 0..6 {
                d.create_task(NewTask::new(format!("leaf {}", i), Priority::Medium).in_run(run.id))
                    .await
                    .unwrap();
            }
            for i in 0..6 {
                let w = d.register_worker(&format!("w{}", i), Vec::<String>::new()).await.unwrap();
                let t = d.claim_next(w.id).await.unwrap().unwrap();
                claims.push((t.id, w.id));
            }

            let handles: Vec<_> = claims
                .into_iter()
                .map(|(task_id, worker_id)| {
                    let d = d.clone();
                    tokio::spawn(async move {
                        d.update_status(task_id, worker_id, TaskStatus::Done).await.unwrap()
                    })
                })
                .collect();
            for result in futures::future::join_all(handles).await {
                result.unwrap();
            }

            assert_eq!(d.get_workflow_run(run.id).await.unwrap().status, RunStatus::Completed);
            let completions = drain(&mut rx)
                .into_iter()
                .filter(|e| matches!(e, DispatchEvent::WorkflowCompleted { .. }))
                .count();
            assert_eq!(completions, 1);
        }
    }

    #[tokio::test]
    async fn test_quarantine_fails_run_and_sums_cost() {
        for d in dispatchers().await {
            let run = d.create_workflow_run("etl").await.unwrap();
            let r = d.register_resource(resource(1_000, None)).await.unwrap();
            let a = d.create_task(NewTask::new("extract", Priority::High).in_run(run.id)).await.unwrap();
            let b = d
                .create_task(NewTask::new("load", Priority::Low).in_run(run.id).with_max_retries(1))
                .await
                .unwrap();
            d.attempt_charge_and_dispatch(r.id, 120, Some(a.id)).await.unwrap();
            d.attempt_charge_and_dispatch(r.id, 30, Some(b.id)).await.unwrap();

            let w = d.register_worker("w", Vec::<String>::new()).await.unwrap();
            let first = d.claim_next(w.id).await.unwrap().unwrap();
            assert_eq!(first.id, a.id);
            d.update_status(a.id, w.id, TaskStatus::Done).await.unwrap();
            d.claim_next(w.id).await.unwrap().unwrap();
            let b = d.report_failure(b.id, w.id, "disk full").await.unwrap();
            assert_eq!(b.status, TaskStatus::Quarantined);

            let run = d.get_workflow_run(run.id).await.unwrap();
            assert_eq!(run.status, RunStatus::Failed);
            assert_eq!(run.total_cost_cents, 150);

            // Closed runs take no new members
            assert!(d
                .create_task(NewTask::new("late", Priority::Low).in_run(run.id))
                .await
                .is_err());
        }
    }

    #[tokio::test]
    async fn test_queue_receives_created_and_released_tasks() {
        let (queue, mut rx) = InMemoryTaskQueue::new();
        let d = memory_dispatcher().with_queue(Arc::new(queue));

        let t = d.create_task(NewTask::new("pushed", Priority::Low)).await.unwrap();
        assert_eq!(rx.recv().await, Some(t.id));

        let r = d.register_resource(resource(0, None)).await.unwrap();
        d.attempt_charge_and_dispatch(r.id, 1, Some(t.id)).await.unwrap();
        d.increase_budget(r.id, 10).await.unwrap();
        assert_eq!(rx.recv().await, Some(t.id));
    }

    #[tokio::test]
    async fn test_claims_work_without_queue() {
        let d = memory_dispatcher();
        let t = d.create_task(NewTask::new("polled", Priority::Low)).await.unwrap();
        let w = d.register_worker("poller", Vec::<String>::new()).await.unwrap();
        assert_eq!(d.claim_next(w.id).await.unwrap().unwrap().id, t.id);
    }

    #[tokio::test]
    async fn test_best_worker_prefers_coverage_then_idle() {
        let d = memory_dispatcher();
        let t = d
            .create_task(NewTask::new("ml", Priority::High).with_capabilities(["python", "gpu"]))
            .await
            .unwrap();
        let half = d.register_worker("half", ["python"]).await.unwrap();
        let full = d.register_worker("full", ["python", "gpu"]).await.unwrap();

        let pick = d.best_worker_for(t.id).await.unwrap().unwrap();
        assert_eq!(pick.worker.id, full.id);
        assert!(pick.eligible);
        assert_eq!(pick.coverage, 1.0);

        d.set_worker_active(full.id, false).await.unwrap();
        let pick = d.best_worker_for(t.id).await.unwrap().unwrap();
        assert_eq!(pick.worker.id, half.id);
        assert!(!pick.eligible);
        assert_eq!(pick.coverage, 0.5);
    }

    #[tokio::test]
    async fn test_worker_registration_and_heartbeat() {
        let d = memory_dispatcher();
        assert!(d.register_worker("  ", ["x"]).await.is_err());
        assert!(d.register_worker("w", [" "]).await.is_err());

        let w = d.register_worker("w", ["x"]).await.unwrap();
        let beat = d.heartbeat(w.id).await.unwrap();
        assert!(beat.last_seen >= w.last_seen);
        assert!(matches!(
            d.heartbeat(WorkerId::new()).await,
            Err(DispatchError::NotFound { .. })
        ));
        assert_eq!(d.list_workers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let d = memory_dispatcher();
        assert!(matches!(
            d.claim_next(WorkerId::new()).await,
            Err(DispatchError::NotFound { .. })
        ));
        assert!(matches!(
            d.attempt_charge_and_dispatch(ResourceId::new(), 1, None).await,
            Err(DispatchError::NotFound { .. })
        ));
        assert!(matches!(
            d.create_subtask(TaskId::new(), NewTask::new("orphan", Priority::Low)).await,
            Err(DispatchError::NotFound { .. })
        ));
        assert!(matches!(
            d.create_task(NewTask::new("lost", Priority::Low).in_run(RunId::new())).await,
            Err(DispatchError::NotFound { .. })
        ));
    }
}
