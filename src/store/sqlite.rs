//! SQLite-based dispatch store.
//!
//! Every trait method runs as one `BEGIN IMMEDIATE` transaction on a blocking
//! thread. IMMEDIATE takes the write lock up front, so two claims can never read
//! the same Pending row and both commit: the second one waits, then sees the
//! row as Claimed.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::{BudgetIncrease, ChargeReceipt, DispatchStore};
use crate::budget::{validate_amount, validate_fallback_chain, ChargeOutcome, ResourceEntry};
use crate::error::{DispatchError, Result};
use crate::ids::{ResourceId, RunId, TaskId, WorkerId};
use crate::task::{matches, Priority, Task, TaskStatus};
use crate::worker::{Worker, WorkerStatus};
use crate::workflow::{evaluate_completion, RunStatus, WorkflowRun};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS workers (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    capabilities TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'idle',
    is_active INTEGER NOT NULL DEFAULT 1,
    last_seen TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_runs (
    id TEXT PRIMARY KEY NOT NULL,
    template TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    start_time TEXT NOT NULL,
    end_time TEXT,
    total_cost_cents INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS resources (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    budget_limit_cents INTEGER NOT NULL CHECK (budget_limit_cents >= 0),
    current_usage_cents INTEGER NOT NULL DEFAULT 0 CHECK (current_usage_cents >= 0),
    status TEXT NOT NULL DEFAULT 'active',
    fallback_id TEXT REFERENCES resources(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL,
    required_capabilities TEXT,
    assigned_worker TEXT REFERENCES workers(id),
    parent_task_id TEXT REFERENCES tasks(id),
    workflow_run_id TEXT REFERENCES workflow_runs(id),
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL CHECK (max_retries >= 1),
    last_error TEXT,
    awaiting_resource TEXT REFERENCES resources(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK (status <> 'claimed' OR assigned_worker IS NOT NULL),
    CHECK (retry_count <= max_retries)
);

CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, priority, created_at, seq);
CREATE INDEX IF NOT EXISTS idx_tasks_run ON tasks(workflow_run_id);
CREATE INDEX IF NOT EXISTS idx_tasks_worker ON tasks(assigned_worker, status);
CREATE INDEX IF NOT EXISTS idx_tasks_awaiting ON tasks(awaiting_resource) WHERE awaiting_resource IS NOT NULL;

CREATE TABLE IF NOT EXISTS charges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_id TEXT NOT NULL REFERENCES resources(id),
    task_id TEXT REFERENCES tasks(id),
    amount_cents INTEGER NOT NULL,
    charged_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_charges_task ON charges(task_id) WHERE task_id IS NOT NULL;
"#;

const TASK_COLUMNS: &str = "id, title, description, status, priority, required_capabilities, \
     assigned_worker, parent_task_id, workflow_run_id, retry_count, max_retries, last_error, \
     awaiting_resource, created_at, updated_at";

const WORKER_COLUMNS: &str = "id, name, capabilities, status, is_active, last_seen";

const RESOURCE_COLUMNS: &str =
    "id, name, budget_limit_cents, current_usage_cents, status, fallback_id, created_at, updated_at";

const RUN_COLUMNS: &str = "id, template, status, start_time, end_time, total_cost_cents";

#[derive(Clone)]
pub struct SqliteDispatchStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDispatchStore {
    /// Open (or create) the database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                DispatchError::Storage(format!("Failed to create store dir: {}", e))
            })?;
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, DispatchError>(conn)
        })
        .await
        .map_err(|e| DispatchError::Storage(format!("Task join error: {}", e)))??;

        tracing::info!("SQLite dispatch store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database, mostly for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, DispatchError>(conn)
        })
        .await
        .map_err(|e| DispatchError::Storage(format!("Task join error: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside one IMMEDIATE transaction. An `Err` rolls everything back.
    async fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
        .map_err(|e| DispatchError::Storage(format!("Task join error: {}", e)))?
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

fn ts(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn text_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion(idx, Type::Text, e))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion(idx, Type::Text, e))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion(idx, Type::Text, e))
    })
    .transpose()
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(|e| conversion(idx, Type::Text, e)))
        .transpose()
}

fn priority_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Priority> {
    let ordinal: u8 = row.get(idx)?;
    Priority::from_ordinal(ordinal).map_err(|e| conversion(idx, Type::Integer, e))
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: text_col(row, 3)?,
        priority: priority_col(row, 4)?,
        required_capabilities: json_col(row, 5)?,
        assigned_worker: row.get(6)?,
        parent_task_id: row.get(7)?,
        workflow_run_id: row.get(8)?,
        retry_count: row.get(9)?,
        max_retries: row.get(10)?,
        last_error: row.get(11)?,
        awaiting_resource: row.get(12)?,
        created_at: time_col(row, 13)?,
        updated_at: time_col(row, 14)?,
    })
}

fn worker_from_row(row: &Row<'_>) -> rusqlite::Result<Worker> {
    Ok(Worker {
        id: row.get(0)?,
        name: row.get(1)?,
        capabilities: json_col(row, 2)?.unwrap_or_default(),
        status: text_col(row, 3)?,
        is_active: row.get(4)?,
        last_seen: time_col(row, 5)?,
    })
}

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<ResourceEntry> {
    Ok(ResourceEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        budget_limit_cents: row.get(2)?,
        current_usage_cents: row.get(3)?,
        status: text_col(row, 4)?,
        fallback_id: row.get(5)?,
        created_at: time_col(row, 6)?,
        updated_at: time_col(row, 7)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowRun> {
    Ok(WorkflowRun {
        id: row.get(0)?,
        template: row.get(1)?,
        status: text_col(row, 2)?,
        start_time: time_col(row, 3)?,
        end_time: opt_time_col(row, 4)?,
        total_cost_cents: row.get(5)?,
    })
}

// ---------------------------------------------------------------------------
// Statements (all run inside a caller's transaction)
// ---------------------------------------------------------------------------

fn fetch_task(tx: &Transaction<'_>, id: TaskId) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
    Ok(tx.query_row(&sql, params![id], task_from_row).optional()?)
}

fn require_task(tx: &Transaction<'_>, id: TaskId) -> Result<Task> {
    fetch_task(tx, id)?.ok_or_else(|| DispatchError::not_found("task", id))
}

fn update_task(tx: &Transaction<'_>, task: &Task) -> Result<()> {
    tx.execute(
        "UPDATE tasks SET status = ?2, assigned_worker = ?3, retry_count = ?4, last_error = ?5,
                awaiting_resource = ?6, updated_at = ?7
         WHERE id = ?1",
        params![
            task.id,
            task.status.as_str(),
            task.assigned_worker,
            task.retry_count,
            task.last_error,
            task.awaiting_resource,
            ts(&task.updated_at),
        ],
    )?;
    Ok(())
}

fn fetch_worker(tx: &Transaction<'_>, id: WorkerId) -> Result<Option<Worker>> {
    let sql = format!("SELECT {} FROM workers WHERE id = ?1", WORKER_COLUMNS);
    Ok(tx.query_row(&sql, params![id], worker_from_row).optional()?)
}

fn require_worker(tx: &Transaction<'_>, id: WorkerId) -> Result<Worker> {
    fetch_worker(tx, id)?.ok_or_else(|| DispatchError::not_found("worker", id))
}

/// Recompute Idle/Busy from the tasks the worker still holds.
fn refresh_worker(tx: &Transaction<'_>, id: WorkerId, now: DateTime<Utc>) -> Result<()> {
    let claims: i64 = tx.query_row(
        "SELECT COUNT(*) FROM tasks WHERE assigned_worker = ?1 AND status = 'claimed'",
        params![id],
        |row| row.get(0),
    )?;
    let status = WorkerStatus::for_claims(usize::try_from(claims).unwrap_or(0));
    tx.execute(
        "UPDATE workers SET status = ?2, last_seen = ?3 WHERE id = ?1",
        params![id, status.as_str(), ts(&now)],
    )?;
    Ok(())
}

fn fetch_resource(tx: &Transaction<'_>, id: ResourceId) -> Result<Option<ResourceEntry>> {
    let sql = format!("SELECT {} FROM resources WHERE id = ?1", RESOURCE_COLUMNS);
    Ok(tx.query_row(&sql, params![id], resource_from_row).optional()?)
}

fn require_resource(tx: &Transaction<'_>, id: ResourceId) -> Result<ResourceEntry> {
    fetch_resource(tx, id)?.ok_or_else(|| DispatchError::not_found("resource", id))
}

fn update_resource(tx: &Transaction<'_>, entry: &ResourceEntry) -> Result<()> {
    tx.execute(
        "UPDATE resources SET budget_limit_cents = ?2, current_usage_cents = ?3, status = ?4,
                updated_at = ?5
         WHERE id = ?1",
        params![
            entry.id,
            entry.budget_limit_cents,
            entry.current_usage_cents,
            entry.status.as_str(),
            ts(&entry.updated_at),
        ],
    )?;
    Ok(())
}

fn fetch_run(tx: &Transaction<'_>, id: RunId) -> Result<Option<WorkflowRun>> {
    let sql = format!("SELECT {} FROM workflow_runs WHERE id = ?1", RUN_COLUMNS);
    Ok(tx.query_row(&sql, params![id], run_from_row).optional()?)
}

fn require_run(tx: &Transaction<'_>, id: RunId) -> Result<WorkflowRun> {
    fetch_run(tx, id)?.ok_or_else(|| DispatchError::not_found("workflow run", id))
}

/// Owner-checked terminal or failure update, shared by finish and failure.
fn release_claim<F>(
    tx: &Transaction<'_>,
    task_id: TaskId,
    worker_id: WorkerId,
    now: DateTime<Utc>,
    apply: F,
) -> Result<Task>
where
    F: FnOnce(&mut Task) -> Result<()>,
{
    require_worker(tx, worker_id)?;
    let mut task = require_task(tx, task_id)?;
    apply(&mut task)?;
    task.check_invariants()?;
    update_task(tx, &task)?;
    refresh_worker(tx, worker_id, now)?;
    Ok(task)
}

#[async_trait]
impl DispatchStore for SqliteDispatchStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn insert_worker(&self, worker: Worker) -> Result<Worker> {
        self.with_tx(move |tx| {
            if fetch_worker(tx, worker.id)?.is_some() {
                return Err(DispatchError::precondition(format!(
                    "worker {} already registered",
                    worker.id
                )));
            }
            tx.execute(
                "INSERT INTO workers (id, name, capabilities, status, is_active, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    worker.id,
                    worker.name,
                    serde_json::to_string(&worker.capabilities)?,
                    worker.status.as_str(),
                    worker.is_active,
                    ts(&worker.last_seen),
                ],
            )?;
            Ok(worker)
        })
        .await
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>> {
        self.with_tx(move |tx| fetch_worker(tx, id)).await
    }

    async fn list_workers(&self) -> Result<Vec<Worker>> {
        self.with_tx(|tx| {
            let sql = format!("SELECT {} FROM workers ORDER BY name, id", WORKER_COLUMNS);
            let mut stmt = tx.prepare(&sql)?;
            let workers = stmt
                .query_map([], worker_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(workers)
        })
        .await
    }

    async fn touch_worker(&self, id: WorkerId, now: DateTime<Utc>) -> Result<Worker> {
        self.with_tx(move |tx| {
            let changed = tx.execute(
                "UPDATE workers SET last_seen = ?2 WHERE id = ?1",
                params![id, ts(&now)],
            )?;
            if changed == 0 {
                return Err(DispatchError::not_found("worker", id));
            }
            require_worker(tx, id)
        })
        .await
    }

    async fn set_worker_active(&self, id: WorkerId, active: bool, now: DateTime<Utc>) -> Result<Worker> {
        self.with_tx(move |tx| {
            let changed = tx.execute(
                "UPDATE workers SET is_active = ?2, last_seen = ?3 WHERE id = ?1",
                params![id, active, ts(&now)],
            )?;
            if changed == 0 {
                return Err(DispatchError::not_found("worker", id));
            }
            require_worker(tx, id)
        })
        .await
    }

    async fn insert_task(&self, task: Task) -> Result<Task> {
        self.with_tx(move |tx| {
            if task.status != TaskStatus::Pending {
                return Err(DispatchError::precondition("new tasks must start pending"));
            }
            task.check_invariants()?;
            if fetch_task(tx, task.id)?.is_some() {
                return Err(DispatchError::precondition(format!("task {} already exists", task.id)));
            }
            if let Some(parent) = task.parent_task_id {
                if fetch_task(tx, parent)?.is_none() {
                    return Err(DispatchError::not_found("parent task", parent));
                }
            }
            if let Some(run_id) = task.workflow_run_id {
                let run = require_run(tx, run_id)?;
                if run.status != RunStatus::Running {
                    return Err(DispatchError::precondition(format!(
                        "workflow run {} is already {}",
                        run.id, run.status
                    )));
                }
            }

            let capabilities = task
                .required_capabilities
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                &format!(
                    "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    TASK_COLUMNS
                ),
                params![
                    task.id,
                    task.title,
                    task.description,
                    task.status.as_str(),
                    task.priority.ordinal(),
                    capabilities,
                    task.assigned_worker,
                    task.parent_task_id,
                    task.workflow_run_id,
                    task.retry_count,
                    task.max_retries,
                    task.last_error,
                    task.awaiting_resource,
                    ts(&task.created_at),
                    ts(&task.updated_at),
                ],
            )?;
            require_task(tx, task.id)
        })
        .await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        self.with_tx(move |tx| fetch_task(tx, id)).await
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        self.with_tx(move |tx| {
            let tasks = match status {
                Some(status) => {
                    let sql = format!("SELECT {} FROM tasks WHERE status = ?1 ORDER BY seq", TASK_COLUMNS);
                    let mut stmt = tx.prepare(&sql)?;
                    let rows = stmt
                        .query_map(params![status.as_str()], task_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let sql = format!("SELECT {} FROM tasks ORDER BY seq", TASK_COLUMNS);
                    let mut stmt = tx.prepare(&sql)?;
                    let rows = stmt
                        .query_map([], task_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            Ok(tasks)
        })
        .await
    }

    async fn claim_next(&self, worker_id: WorkerId, now: DateTime<Utc>) -> Result<Option<Task>> {
        self.with_tx(move |tx| {
            let worker = require_worker(tx, worker_id)?;
            if !worker.is_active {
                return Err(DispatchError::precondition(format!(
                    "worker {} is not active",
                    worker_id
                )));
            }

            let chosen = {
                let sql = format!(
                    "SELECT {} FROM tasks WHERE status = 'pending' ORDER BY priority, created_at, seq",
                    TASK_COLUMNS
                );
                let mut stmt = tx.prepare(&sql)?;
                let mut chosen = None;
                for task in stmt.query_map([], task_from_row)? {
                    let task = task?;
                    if matches(task.required_capabilities.as_ref(), &worker.capabilities) {
                        chosen = Some(task);
                        break;
                    }
                }
                chosen
            };
            let Some(mut task) = chosen else {
                return Ok(None);
            };

            task.claim(worker_id, now)?;
            task.check_invariants()?;
            update_task(tx, &task)?;
            refresh_worker(tx, worker_id, now)?;
            Ok(Some(task))
        })
        .await
    }

    async fn finish_task(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        self.with_tx(move |tx| {
            release_claim(tx, task_id, worker_id, now, |task| task.finish(worker_id, status, now))
        })
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
        self.with_tx(move |tx| {
            release_claim(tx, task_id, worker_id, now, |task| {
                task.record_failure(worker_id, &error, now).map(|_| ())
            })
        })
        .await
    }

    async fn insert_resource(&self, entry: ResourceEntry) -> Result<ResourceEntry> {
        self.with_tx(move |tx| {
            if fetch_resource(tx, entry.id)?.is_some() {
                return Err(DispatchError::precondition(format!(
                    "resource {} already exists",
                    entry.id
                )));
            }
            let graph: HashMap<ResourceId, Option<ResourceId>> = {
                let mut stmt = tx.prepare("SELECT id, fallback_id FROM resources")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, ResourceId>(0)?, row.get::<_, Option<ResourceId>>(1)?))
                    })?
                    .collect::<rusqlite::Result<HashMap<_, _>>>()?;
                rows
            };
            validate_fallback_chain(entry.id, entry.fallback_id, |id| graph.get(&id).copied())?;

            tx.execute(
                &format!(
                    "INSERT INTO resources ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    RESOURCE_COLUMNS
                ),
                params![
                    entry.id,
                    entry.name,
                    entry.budget_limit_cents,
                    entry.current_usage_cents,
                    entry.status.as_str(),
                    entry.fallback_id,
                    ts(&entry.created_at),
                    ts(&entry.updated_at),
                ],
            )?;
            Ok(entry)
        })
        .await
    }

    async fn get_resource(&self, id: ResourceId) -> Result<Option<ResourceEntry>> {
        self.with_tx(move |tx| fetch_resource(tx, id)).await
    }

    async fn attempt_charge(
        &self,
        resource_id: ResourceId,
        amount_cents: i64,
        task_id: Option<TaskId>,
        now: DateTime<Utc>,
    ) -> Result<ChargeReceipt> {
        validate_amount(amount_cents)?;
        self.with_tx(move |tx| {
            let mut entry = require_resource(tx, resource_id)?;
            let fallback = match entry.fallback_id {
                Some(id) => fetch_resource(tx, id)?,
                None => None,
            };
            let task = match task_id {
                Some(id) => Some(require_task(tx, id)?),
                None => None,
            };

            let result = entry.apply_charge(amount_cents, fallback.as_ref(), now)?;
            update_resource(tx, &entry)?;

            let mut held_task = None;
            match result.outcome {
                ChargeOutcome::Charged(_) => {
                    tx.execute(
                        "INSERT INTO charges (resource_id, task_id, amount_cents, charged_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![resource_id, task_id, amount_cents, ts(&now)],
                    )?;
                }
                ChargeOutcome::Rejected => {
                    if let Some(mut task) = task.filter(|t| t.status == TaskStatus::Pending) {
                        task.hold_for_budget(resource_id, now)?;
                        task.check_invariants()?;
                        update_task(tx, &task)?;
                        held_task = Some(task.id);
                    }
                }
                ChargeOutcome::Substituted(_) => {}
            }

            Ok(ChargeReceipt {
                outcome: result.outcome,
                newly_suspended: result.newly_suspended,
                held_task,
            })
        })
        .await
    }

    async fn hold_task(&self, task_id: TaskId, resource_id: ResourceId, now: DateTime<Utc>) -> Result<Option<TaskId>> {
        self.with_tx(move |tx| {
            require_resource(tx, resource_id)?;
            let mut task = require_task(tx, task_id)?;
            if task.status != TaskStatus::Pending {
                return Ok(None);
            }
            task.hold_for_budget(resource_id, now)?;
            task.check_invariants()?;
            update_task(tx, &task)?;
            Ok(Some(task_id))
        })
        .await
    }

    async fn increase_budget(
        &self,
        resource_id: ResourceId,
        additional_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<BudgetIncrease> {
        self.with_tx(move |tx| {
            let mut entry = require_resource(tx, resource_id)?;
            entry.increase_limit(additional_cents, now)?;
            update_resource(tx, &entry)?;

            let waiting = {
                let sql = format!(
                    "SELECT {} FROM tasks WHERE status = 'awaiting_budget_approval' AND awaiting_resource = ?1 ORDER BY seq",
                    TASK_COLUMNS
                );
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![resource_id], task_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let mut released_tasks = Vec::with_capacity(waiting.len());
            for mut task in waiting {
                task.release_budget_hold(now)?;
                update_task(tx, &task)?;
                released_tasks.push(task.id);
            }

            Ok(BudgetIncrease {
                resource: entry,
                released_tasks,
            })
        })
        .await
    }

    async fn insert_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        self.with_tx(move |tx| {
            if fetch_run(tx, run.id)?.is_some() {
                return Err(DispatchError::precondition(format!(
                    "workflow run {} already exists",
                    run.id
                )));
            }
            tx.execute(
                &format!(
                    "INSERT INTO workflow_runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    RUN_COLUMNS
                ),
                params![
                    run.id,
                    run.template,
                    run.status.as_str(),
                    ts(&run.start_time),
                    run.end_time.as_ref().map(ts),
                    run.total_cost_cents,
                ],
            )?;
            Ok(run)
        })
        .await
    }

    async fn get_run(&self, id: RunId) -> Result<Option<WorkflowRun>> {
        self.with_tx(move |tx| fetch_run(tx, id)).await
    }

    async fn complete_run_if_finished(&self, run_id: RunId, now: DateTime<Utc>) -> Result<Option<WorkflowRun>> {
        self.with_tx(move |tx| {
            let mut run = require_run(tx, run_id)?;
            if run.status != RunStatus::Running {
                return Ok(None);
            }

            let statuses = {
                let mut stmt = tx.prepare("SELECT status FROM tasks WHERE workflow_run_id = ?1")?;
                let rows = stmt
                    .query_map(params![run_id], |row| text_col::<TaskStatus>(row, 0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            let Some(status) = evaluate_completion(statuses) else {
                return Ok(None);
            };

            let total_cost_cents: i64 = tx.query_row(
                "SELECT COALESCE(SUM(c.amount_cents), 0)
                 FROM charges c JOIN tasks t ON t.id = c.task_id
                 WHERE t.workflow_run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )?;

            run.finish(status, total_cost_cents, now)?;
            tx.execute(
                "UPDATE workflow_runs SET status = ?2, end_time = ?3, total_cost_cents = ?4 WHERE id = ?1",
                params![
                    run.id,
                    run.status.as_str(),
                    run.end_time.as_ref().map(ts),
                    run.total_cost_cents,
                ],
            )?;
            Ok(Some(run))
        })
        .await
    }
}
