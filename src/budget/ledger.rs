//! Budget ledger entries for metered resources.
//!
//! # Invariants
//! - `budget_limit_cents >= 0` and `current_usage_cents >= 0`
//! - `current_usage_cents` only grows through [`ResourceEntry::apply_charge`]
//! - `status == Suspended` => the most recent charge attempt would have pushed
//!   usage past the limit
//!
//! # Design for Provability
//! The arithmetic lives here as pure methods on a row value. Stores lock the
//! row, call [`ResourceEntry::apply_charge`] on a copy, and write the copy back
//! in the same transaction.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::ids::{ResourceId, TaskId};

/// Longest fallback chain accepted at registration time.
pub const MAX_FALLBACK_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Active,
    Suspended,
}

impl ResourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceStatus::Active => "active",
            ResourceStatus::Suspended => "suspended",
        }
    }
}

impl std::str::FromStr for ResourceStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ResourceStatus::Active),
            "suspended" => Ok(ResourceStatus::Suspended),
            other => Err(DispatchError::precondition(format!(
                "unknown resource status '{}'",
                other
            ))),
        }
    }
}

/// Result of a single charge attempt.
///
/// Serialises as `{"charged": id}`, `{"substituted": id}` or `"rejected"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeOutcome {
    /// Usage on this resource was increased.
    Charged(ResourceId),
    /// Over budget; the caller should retry against this fallback. Nothing was charged.
    Substituted(ResourceId),
    /// Over budget with no usable fallback.
    Rejected,
}

/// Outcome plus what the caller must announce after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeResult {
    pub outcome: ChargeOutcome,
    /// The entry moved from Active to Suspended during this attempt.
    pub newly_suspended: bool,
}

/// Request to register a metered resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResource {
    pub name: String,
    /// Zero means every positive charge is over budget.
    pub budget_limit_cents: i64,
    #[serde(default)]
    pub fallback_id: Option<ResourceId>,
}

/// A successful charge, kept for run cost aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRecord {
    pub resource_id: ResourceId,
    pub task_id: Option<TaskId>,
    pub amount_cents: i64,
    pub charged_at: DateTime<Utc>,
}

/// Per-resource spend state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub id: ResourceId,
    pub name: String,
    pub budget_limit_cents: i64,
    pub current_usage_cents: i64,
    pub status: ResourceStatus,
    pub fallback_id: Option<ResourceId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Reject negative amounts before any row is touched.
pub fn validate_amount(amount_cents: i64) -> Result<()> {
    if amount_cents < 0 {
        return Err(DispatchError::precondition(format!(
            "charge amount must be non-negative, got {}",
            amount_cents
        )));
    }
    Ok(())
}

impl ResourceEntry {
    /// Create an Active entry with zero usage.
    pub fn create(new: NewResource, now: DateTime<Utc>) -> Result<Self> {
        if new.name.trim().is_empty() {
            return Err(DispatchError::precondition("resource name must not be empty"));
        }
        if new.budget_limit_cents < 0 {
            return Err(DispatchError::precondition("budget limit must be non-negative"));
        }
        Ok(Self {
            id: ResourceId::new(),
            name: new.name.trim().to_string(),
            budget_limit_cents: new.budget_limit_cents,
            current_usage_cents: 0,
            status: ResourceStatus::Active,
            fallback_id: new.fallback_id,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get the remaining budget in cents.
    ///
    /// # Property
    /// `remaining_cents() == max(0, budget_limit_cents - current_usage_cents)`
    pub fn remaining_cents(&self) -> i64 {
        self.budget_limit_cents
            .saturating_sub(self.current_usage_cents)
            .max(0)
    }

    /// `true` if charging `amount_cents` would push usage past the limit.
    pub fn would_exceed(&self, amount_cents: i64) -> bool {
        amount_cents > self.remaining_cents()
    }

    /// Attempt to charge this entry.
    ///
    /// `fallback` is the entry named by `fallback_id`, read in the same
    /// transaction; it is only inspected, never charged.
    ///
    /// # Precondition
    /// `amount_cents >= 0`
    ///
    /// # Postconditions
    /// - `Charged` => usage increased by exactly `amount_cents`, status Active
    /// - `Substituted | Rejected` => usage unchanged, status Suspended
    pub fn apply_charge(
        &mut self,
        amount_cents: i64,
        fallback: Option<&ResourceEntry>,
        now: DateTime<Utc>,
    ) -> Result<ChargeResult> {
        validate_amount(amount_cents)?;

        if self.would_exceed(amount_cents) {
            let newly_suspended = self.status == ResourceStatus::Active;
            self.status = ResourceStatus::Suspended;
            self.updated_at = now;

            let usable = fallback.filter(|f| {
                Some(f.id) == self.fallback_id && f.id != self.id && f.status == ResourceStatus::Active
            });
            let outcome = match usable {
                Some(f) => ChargeOutcome::Substituted(f.id),
                None => ChargeOutcome::Rejected,
            };
            return Ok(ChargeResult {
                outcome,
                newly_suspended,
            });
        }

        self.current_usage_cents += amount_cents;
        self.status = ResourceStatus::Active;
        self.updated_at = now;
        Ok(ChargeResult {
            outcome: ChargeOutcome::Charged(self.id),
            newly_suspended: false,
        })
    }

    /// Administrative increase: raise the limit and reactivate in one step.
    pub fn increase_limit(&mut self, additional_cents: i64, now: DateTime<Utc>) -> Result<()> {
        if additional_cents <= 0 {
            return Err(DispatchError::precondition(
                "budget increase must be positive",
            ));
        }
        self.budget_limit_cents = self
            .budget_limit_cents
            .checked_add(additional_cents)
            .ok_or_else(|| DispatchError::precondition("budget limit overflow"))?;
        self.status = ResourceStatus::Active;
        self.updated_at = now;
        Ok(())
    }
}

/// Check that registering `new_id` with `fallback` keeps fallback chains acyclic.
///
/// `fallback_of` returns `None` for an unknown resource and `Some(next)` for a
/// known one. Chains longer than [`MAX_FALLBACK_DEPTH`] are refused.
pub fn validate_fallback_chain<F>(
    new_id: ResourceId,
    fallback: Option<ResourceId>,
    mut fallback_of: F,
) -> Result<()>
where
    F: FnMut(ResourceId) -> Option<Option<ResourceId>>,
{
    let mut seen = HashSet::from([new_id]);
    let mut next = fallback;
    let mut depth = 0;

    while let Some(current) = next {
        if !seen.insert(current) {
            return Err(DispatchError::precondition(format!(
                "fallback chain of {} forms a cycle at {}",
                new_id, current
            )));
        }
        depth += 1;
        if depth > MAX_FALLBACK_DEPTH {
            return Err(DispatchError::precondition(format!(
                "fallback chain of {} is longer than {}",
                new_id, MAX_FALLBACK_DEPTH
            )));
        }
        next = fallback_of(current).ok_or_else(|| DispatchError::not_found("resource", current))?;
    }
    Ok(())
}
