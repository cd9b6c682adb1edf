//! Failure bookkeeping and retry backoff.
//!
//! A failed task is unassigned rather than handed back to the worker that
//! failed it, so the next attempt can land on any qualified worker:
//! - retries remain: Claimed -> Pending, immediately claimable again
//! - retries exhausted: Claimed -> Quarantined, terminal

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::WorkerId;
use crate::task::{Task, TaskStatus};

/// What happened to a task after a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureDisposition {
    Requeued { retry_count: u32 },
    Quarantined { retry_count: u32 },
}

/// Exponential backoff for push re-notification of re-queued tasks.
///
/// Only the queue collaborator honours the delay; the Pending row is claimable
/// by polling straight away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// `min(base_delay * 2^retry_count, max_delay)`, saturating.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let multiplier = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Task {
    /// Record a failure reported by `worker`.
    ///
    /// # Preconditions
    /// The task is Claimed by `worker`; otherwise `OwnershipViolation` and the
    /// task is untouched.
    ///
    /// # Postconditions
    /// - `retry_count` increased by one, `last_error == error`
    /// - `assigned_worker == None`
    /// - `priority` and `created_at` unchanged
    pub fn record_failure(
        &mut self,
        worker: WorkerId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition> {
        self.ensure_owned_by(worker)?;

        let retry_count = self.retry_count.saturating_add(1).min(self.max_retries);
        let exhausted = retry_count >= self.max_retries;
        let next = if exhausted {
            TaskStatus::Quarantined
        } else {
            TaskStatus::Pending
        };

        self.transition(next, now)?;
        self.retry_count = retry_count;
        self.last_error = Some(error.to_string());
        self.assigned_worker = None;

        Ok(if exhausted {
            FailureDisposition::Quarantined { retry_count }
        } else {
            FailureDisposition::Requeued { retry_count }
        })
    }
}
