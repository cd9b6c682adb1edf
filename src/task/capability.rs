//! Capability matching between task requirements and worker skills.
//!
//! Pure functions, no IO. Claims use [`matches`]; [`coverage`] and
//! [`rank_workers`] only advise which worker suits a task best.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use crate::worker::{Worker, WorkerStatus};

/// Subset test: every required capability must be offered.
///
/// Absent or empty requirements match any worker. O(|required|).
pub fn matches(required: Option<&BTreeSet<String>>, offered: &HashSet<String>) -> bool {
    match required {
        None => true,
        Some(required) => required.iter().all(|cap| offered.contains(cap)),
    }
}

/// Fraction of the required capabilities that `offered` covers, in [0.0, 1.0].
///
/// Unrestricted tasks are fully covered by everyone.
pub fn coverage(required: Option<&BTreeSet<String>>, offered: &HashSet<String>) -> f64 {
    match required {
        Some(required) if !required.is_empty() => {
            let hit = required.iter().filter(|cap| offered.contains(*cap)).count();
            hit as f64 / required.len() as f64
        }
        _ => 1.0,
    }
}

/// A worker together with how well it fits a task.
#[derive(Debug, Clone)]
pub struct WorkerFit<'a> {
    pub worker: &'a Worker,
    pub coverage: f64,
    pub matched: usize,
}

/// Rank active workers for a task: coverage first, then number of matched
/// capabilities, then idle before busy.
pub fn rank_workers<'a>(
    required: Option<&BTreeSet<String>>,
    workers: impl IntoIterator<Item = &'a Worker>,
) -> Vec<WorkerFit<'a>> {
    let mut fits: Vec<WorkerFit<'a>> = workers
        .into_iter()
        .filter(|w| w.is_active)
        .map(|worker| WorkerFit {
            worker,
            coverage: coverage(required, &worker.capabilities),
            matched: required
                .map(|r| r.iter().filter(|c| worker.capabilities.contains(*c)).count())
                .unwrap_or(0),
        })
        .collect();

    fits.sort_by(|a, b| {
        b.coverage
            .partial_cmp(&a.coverage)
            .unwrap_or(Ordering::Equal)
            .then(b.matched.cmp(&a.matched))
            .then(idle_first(a.worker.status).cmp(&idle_first(b.worker.status)))
    });
    fits
}

fn idle_first(status: WorkerStatus) -> u8 {
    match status {
        WorkerStatus::Idle => 0,
        WorkerStatus::Busy => 1,
    }
}
