//! Workers (agents) that claim and execute tasks.
//!
//! # Invariants
//! - `status == Busy` <=> the worker holds at least one Claimed task
//!
//! Stores flip the status inside the same transaction as the claim or release.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
        }
    }

    /// Status implied by the number of tasks the worker currently holds.
    pub fn for_claims(claims: usize) -> Self {
        if claims == 0 {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Busy
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = crate::error::DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerStatus::Idle),
            "busy" => Ok(WorkerStatus::Busy),
            other => Err(crate::error::DispatchError::precondition(format!(
                "unknown worker status '{}'",
                other
            ))),
        }
    }
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub capabilities: HashSet<String>,
    pub status: WorkerStatus,
    /// Inactive workers are refused before any task scan.
    pub is_active: bool,
    pub last_seen: DateTime<Utc>,
}

impl Worker {
    pub fn new<I, S>(name: impl Into<String>, capabilities: I, now: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: WorkerId::new(),
            name: name.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: WorkerStatus::Idle,
            is_active: true,
            last_seen: now,
        }
    }

    pub(crate) fn mark_claimed(&mut self, now: DateTime<Utc>) {
        self.status = WorkerStatus::Busy;
        self.last_seen = now;
    }

    /// Recompute status after a release, given the claims still held.
    pub(crate) fn mark_released(&mut self, remaining_claims: usize, now: DateTime<Utc>) {
        self.status = WorkerStatus::for_claims(remaining_claims);
        self.last_seen = now;
    }
}
