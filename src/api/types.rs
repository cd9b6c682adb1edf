//! API request and response types.

use std::collections::BTreeSet;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::budget::ChargeOutcome;
use crate::error::{DispatchError, Result};
use crate::ids::{RunId, TaskId, WorkerId};
use crate::task::{NewTask, Task, TaskStatus};

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether the store survives a restart.
    pub persistent: bool,
}

/// Request to create a task (or a subtask, where the parent comes from the path).
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,

    #[serde(default)]
    pub description: Option<String>,

    /// `critical`, `high`, `medium` or `low`, case-insensitive
    pub priority: String,

    /// Absent or empty means any worker may claim the task
    #[serde(default)]
    pub required_capabilities: Option<BTreeSet<String>>,

    #[serde(default)]
    pub workflow_run_id: Option<RunId>,

    /// Uses the configured default if not specified
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl CreateTaskRequest {
    /// Parse the priority and build the task request.
    pub fn into_new_task(self) -> Result<NewTask> {
        Ok(NewTask {
            title: self.title,
            description: self.description,
            priority: self.priority.parse()?,
            required_capabilities: self.required_capabilities,
            parent_task_id: None,
            workflow_run_id: self.workflow_run_id,
            max_retries: self.max_retries,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<String>,
}

impl ListTasksQuery {
    pub fn status(&self) -> Result<Option<TaskStatus>> {
        self.status.as_deref().map(str::parse::<TaskStatus>).transpose()
    }
}

/// Owner-reported completion.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStatusRequest {
    pub worker_id: WorkerId,
    /// `done` or `quarantined`
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportFailureRequest {
    pub worker_id: WorkerId,
    pub error: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterWorkerRequest {
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
}

/// Claim result; `task` is null when nothing is claimable right now.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimResponse {
    pub task: Option<Task>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeRequest {
    pub amount_cents: i64,
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeResponse {
    pub outcome: ChargeOutcome,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncreaseBudgetRequest {
    pub additional_cents: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRunRequest {
    pub template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::PreconditionViolation(_) => StatusCode::BAD_REQUEST,
            DispatchError::IllegalTransition { .. } => StatusCode::CONFLICT,
            DispatchError::OwnershipViolation { .. } => StatusCode::FORBIDDEN,
            DispatchError::NotFound { .. } => StatusCode::NOT_FOUND,
            DispatchError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
