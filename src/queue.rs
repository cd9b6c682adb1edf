//! Optional push queue for task ids.
//!
//! The queue only speeds up discovery. Claims always work by polling the
//! store, so a missing or failing queue never loses work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{DispatchError, Result};
use crate::ids::TaskId;

/// Queue collaborator boundary.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Announce a newly claimable task.
    async fn publish(&self, task_id: TaskId) -> Result<()>;

    /// Announce a re-queued task once `delay` has passed.
    async fn publish_delayed(&self, task_id: TaskId, delay: Duration) -> Result<()>;
}

pub type SharedQueue = Arc<dyn TaskQueue>;

/// In-process queue backed by an unbounded channel.
#[derive(Clone)]
pub struct InMemoryTaskQueue {
    tx: mpsc::UnboundedSender<TaskId>,
}

impl InMemoryTaskQueue {
    /// Create the queue and the receiving end consumers read from.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn publish(&self, task_id: TaskId) -> Result<()> {
        self.tx
            .send(task_id)
            .map_err(|_| DispatchError::Storage("task queue receiver dropped".to_string()))
    }

    async fn publish_delayed(&self, task_id: TaskId, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return self.publish(task_id).await;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(task_id).is_err() {
                tracing::debug!("Dropping delayed publish of {}: receiver gone", task_id);
            }
        });
        Ok(())
    }
}
