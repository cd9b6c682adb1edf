//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::budget::{NewResource, ResourceEntry};
use crate::config::{Config, QueueMode};
use crate::dispatch::{Dispatcher, WorkerRecommendation};
use crate::error::{DispatchError, Result};
use crate::events::EventBus;
use crate::ids::{ResourceId, RunId, TaskId, WorkerId};
use crate::queue::InMemoryTaskQueue;
use crate::store::{BudgetIncrease, InMemoryDispatchStore, SharedStore, SqliteDispatchStore};
use crate::task::{Task, TaskStatus};
use crate::worker::Worker;
use crate::workflow::WorkflowRun;

use super::types::*;

/// Shared application state.
pub struct AppState {
    pub dispatcher: Dispatcher,
}

/// Build the dispatcher the config asks for: SQLite when a database path is
/// set, in-memory otherwise, plus the optional queue collaborator.
pub async fn build_dispatcher(config: &Config) -> anyhow::Result<Dispatcher> {
    let store: SharedStore = match &config.db_path {
        Some(path) => {
            tracing::info!("Using SQLite dispatch store at {}", path.display());
            Arc::new(SqliteDispatchStore::new(path).await?)
        }
        None => {
            tracing::warn!("DISPATCH_DB_PATH not set, using in-memory store (nothing survives a restart)");
            Arc::new(InMemoryDispatchStore::new())
        }
    };

    let events = EventBus::default();
    spawn_event_logger(events.subscribe());

    let dispatcher = Dispatcher::new(store, events, config.dispatch.clone());
    Ok(match config.queue {
        QueueMode::None => dispatcher,
        QueueMode::Memory => {
            let (queue, mut rx) = InMemoryTaskQueue::new();
            tokio::spawn(async move {
                while let Some(task_id) = rx.recv().await {
                    tracing::debug!(task_id = %task_id, "Task ready for push dispatch");
                }
            });
            dispatcher.with_queue(Arc::new(queue))
        }
    })
}

/// Drain domain events into the log so they are visible without a subscriber.
fn spawn_event_logger(mut rx: broadcast::Receiver<crate::events::DispatchEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!(target: "agent_dispatch::events", "{}", json),
                    Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event logger lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Build the router over an existing state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        // Tasks
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/subtasks", post(create_subtask))
        .route("/api/tasks/:id/status", post(update_status))
        .route("/api/tasks/:id/failure", post(report_failure))
        .route("/api/tasks/:id/best-worker", get(best_worker))
        // Workers
        .route("/api/workers", post(register_worker).get(list_workers))
        .route("/api/workers/:id", get(get_worker))
        .route("/api/workers/:id/claim", post(claim_next))
        .route("/api/workers/:id/heartbeat", post(heartbeat))
        .route("/api/workers/:id/active", post(set_worker_active))
        // Budget ledger
        .route("/api/resources", post(register_resource))
        .route("/api/resources/:id", get(get_resource))
        .route("/api/resources/:id/charge", post(attempt_charge))
        .route("/api/resources/:id/charge-chain", post(charge_chain))
        .route("/api/resources/:id/increase", post(increase_budget))
        // Workflow runs
        .route("/api/runs", post(create_run))
        .route("/api/runs/:id", get(get_run))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let dispatcher = build_dispatcher(&config).await?;
    let state = Arc::new(AppState { dispatcher });
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining in-flight requests");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        persistent: state.dispatcher.is_persistent(),
    })
}

// === Tasks ===

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<Task>> {
    let new = req.into_new_task()?;
    Ok(Json(state.dispatcher.create_task(new).await?))
}

async fn create_subtask(
    State(state): State<Arc<AppState>>,
    Path(parent_id): Path<TaskId>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<Task>> {
    let new = req.into_new_task()?;
    Ok(Json(state.dispatcher.create_subtask(parent_id, new).await?))
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>> {
    let status = query.status()?;
    Ok(Json(state.dispatcher.list_tasks(status).await?))
}

async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<TaskId>) -> Result<Json<Task>> {
    Ok(Json(state.dispatcher.get_task(id).await?))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<Task>> {
    let status: TaskStatus = req.status.parse()?;
    Ok(Json(
        state
            .dispatcher
            .update_status(id, req.worker_id, status)
            .await?,
    ))
}

async fn report_failure(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
    Json(req): Json<ReportFailureRequest>,
) -> Result<Json<Task>> {
    Ok(Json(
        state
            .dispatcher
            .report_failure(id, req.worker_id, &req.error)
            .await?,
    ))
}

async fn best_worker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<WorkerRecommendation>> {
    state
        .dispatcher
        .best_worker_for(id)
        .await?
        .map(Json)
        .ok_or_else(|| DispatchError::not_found("active worker for task", id))
}

// === Workers ===

async fn register_worker(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<Json<Worker>> {
    Ok(Json(
        state
            .dispatcher
            .register_worker(&req.name, req.capabilities)
            .await?,
    ))
}

async fn list_workers(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Worker>>> {
    Ok(Json(state.dispatcher.list_workers().await?))
}

async fn get_worker(State(state): State<Arc<AppState>>, Path(id): Path<WorkerId>) -> Result<Json<Worker>> {
    Ok(Json(state.dispatcher.get_worker(id).await?))
}

async fn claim_next(
    State(state): State<Arc<AppState>>,
    Path(id): Path<WorkerId>,
) -> Result<Json<ClaimResponse>> {
    let task = state.dispatcher.claim_next(id).await?;
    Ok(Json(ClaimResponse { task }))
}

async fn heartbeat(State(state): State<Arc<AppState>>, Path(id): Path<WorkerId>) -> Result<Json<Worker>> {
    Ok(Json(state.dispatcher.heartbeat(id).await?))
}

async fn set_worker_active(
    State(state): State<Arc<AppState>>,
    Path(id): Path<WorkerId>,
    Json(req): Json<SetActiveRequest>,
) -> Result<Json<Worker>> {
    Ok(Json(state.dispatcher.set_worker_active(id, req.active).await?))
}

// === Budget ledger ===

async fn register_resource(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewResource>,
) -> Result<Json<ResourceEntry>> {
    Ok(Json(state.dispatcher.register_resource(req).await?))
}

async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ResourceId>,
) -> Result<Json<ResourceEntry>> {
    Ok(Json(state.dispatcher.get_resource(id).await?))
}

async fn attempt_charge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ResourceId>,
    Json(req): Json<ChargeRequest>,
) -> Result<Json<ChargeResponse>> {
    let outcome = state
        .dispatcher
        .attempt_charge_and_dispatch(id, req.amount_cents, req.task_id)
        .await?;
    Ok(Json(ChargeResponse { outcome }))
}

async fn charge_chain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ResourceId>,
    Json(req): Json<ChargeRequest>,
) -> Result<Json<ChargeResponse>> {
    let outcome = state
        .dispatcher
        .charge_following_fallbacks(id, req.amount_cents, req.task_id)
        .await?;
    Ok(Json(ChargeResponse { outcome }))
}

async fn increase_budget(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ResourceId>,
    Json(req): Json<IncreaseBudgetRequest>,
) -> Result<Json<BudgetIncrease>> {
    Ok(Json(
        state
            .dispatcher
            .increase_budget(id, req.additional_cents)
            .await?,
    ))
}

// === Workflow runs ===

async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRunRequest>,
) -> Result<Json<WorkflowRun>> {
    Ok(Json(state.dispatcher.create_workflow_run(&req.template).await?))
}

async fn get_run(State(state): State<Arc<AppState>>, Path(id): Path<RunId>) -> Result<Json<WorkflowRun>> {
    Ok(Json(state.dispatcher.get_workflow_run(id).await?))
}
