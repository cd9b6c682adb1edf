//! Domain events for the notification collaborator.
//!
//! Events are published only after the owning transaction has committed.
//! Publishing never blocks and never fails the operation that emitted it:
//! with no subscribers the event is dropped, and a lagging subscriber loses
//! the oldest events.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ids::{ResourceId, RunId, TaskId, WorkerId};
use crate::task::Priority;
use crate::workflow::RunStatus;

/// Events announced to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    TaskCreated { task_id: TaskId, priority: Priority },
    TaskClaimed { task_id: TaskId, worker_id: WorkerId },
    /// A failed task went back to Pending; `delay` is the push backoff.
    TaskRequeued { task_id: TaskId, retry_count: u32, delay: Duration },
    TaskQuarantined { task_id: TaskId, last_error: Option<String> },
    ResourceSuspended { resource_id: ResourceId },
    WorkflowCompleted { run_id: RunId, status: RunStatus },
}

/// Fan-out channel for [`DispatchEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget publish.
    pub fn publish(&self, event: DispatchEvent) {
        tracing::debug!(?event, "publishing dispatch event");
        if self.tx.send(event).is_err() {
            tracing::trace!("no event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
