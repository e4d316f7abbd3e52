//! The seam between the dispatcher and the work it runs.

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::lane::Lane;

/// Everything a handler gets for one delivery of a task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub lane: Lane,
    /// 1-based delivery count, including this one.
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: serde_json::Value,
    /// Triggered when the dispatcher gives up waiting on shutdown.
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Decode the payload. A malformed payload can never succeed, so the
    /// failure is terminal.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TaskFailure> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| TaskFailure::terminal(format!("Invalid task payload: {e}")))
    }

    /// `true` when a retryable failure now would bury the task instead.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// How a delivery failed, from the queue's point of view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TaskFailure {
    retryable: bool,
    message: String,
}

impl TaskFailure {
    /// Re-queue with backoff while the retry budget lasts.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    /// Do not retry.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Work run for each claimed task.
///
/// Must tolerate being invoked more than once for the same payload:
/// delivery is at-least-once.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: TaskContext) -> Result<(), TaskFailure>;

    /// The dispatcher is burying `task` without [`handle`](Self::handle)
    /// having settled it: a redelivery past the retry budget, or a crash
    /// on the final attempt. Runs before the bury.
    async fn abandoned(&self, _task: &TaskContext, _reason: &str) {}
}
