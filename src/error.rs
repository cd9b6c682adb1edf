//! Error taxonomy for dispatch operations.
//!
//! Only rejected requests are errors. Budget exhaustion, retry exhaustion and
//! claim contention are ordinary outcomes (`ChargeOutcome::Rejected`,
//! `TaskStatus::Quarantined`, `Ok(None)`).

use crate::ids::{TaskId, WorkerId};
use crate::task::TaskStatus;

/// Errors produced by the dispatch engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The request is malformed or the target is not in a usable state.
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    /// A worker tried to act on a task it does not currently own.
    #[error("Worker {worker_id} does not own task {task_id}")]
    OwnershipViolation { task_id: TaskId, worker_id: WorkerId },

    /// The requested status change is not in the transition table.
    #[error("Illegal task transition from {from} to {to}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The backing store failed; the operation was rolled back.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl DispatchError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionViolation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<rusqlite::Error> for DispatchError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
