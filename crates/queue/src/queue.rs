//! Enqueue side of the task queue.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::lane::Lane;
use crate::store::{TaskStore, TaskStoreError};

/// Default retry budget per task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Errors from [`TaskQueue::enqueue`].
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("Failed to encode task payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Queue unavailable: {0}")]
    Unavailable(#[from] TaskStoreError),
}

/// Receipt for an enqueued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: Uuid,
    pub lane: Lane,
}

/// Producer handle over a [`TaskStore`]. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    max_attempts: u32,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the retry budget given to newly enqueued tasks.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Durably enqueue `payload` on `lane`.
    pub async fn enqueue<T: Serialize + Sync>(
        &self,
        lane: Lane,
        payload: &T,
    ) -> Result<TaskHandle, EnqueueError> {
        let payload = serde_json::to_value(payload)?;
        let id = self.store.enqueue(lane, payload, self.max_attempts).await?;
        tracing::info!(task_id = %id, lane = %lane, "Task enqueued");
        Ok(TaskHandle { id, lane })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::memory::{MemoryTaskState, MemoryTaskStore};

    #[tokio::test]
    async fn enqueue_stores_pending_task_with_budget() {
        let store = Arc::new(MemoryTaskStore::new());
        let queue = TaskQueue::new(store.clone()).with_max_attempts(5);

        let handle = queue
            .enqueue(Lane::Critical, &serde_json::json!({ "n": 1 }))
            .await
            .unwrap();

        assert_eq!(handle.lane, Lane::Critical);
        let stored = store.find(handle.id).unwrap();
        assert_eq!(stored.state, MemoryTaskState::Pending);
        assert_eq!(stored.lane, Lane::Critical);

        let claimed = store
            .claim(Lane::Critical, std::time::Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.max_attempts, 5);
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_unavailable() {
        let store = Arc::new(MemoryTaskStore::new());
        store.set_unavailable(Some("connection refused"));
        let queue = TaskQueue::new(store);

        let err = queue
            .enqueue(Lane::Default, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_matches!(err, EnqueueError::Unavailable(TaskStoreError::Unavailable(_)));
    }
}
