//! Storage seam for durable tasks, and its Postgres implementation.

use std::time::Duration;

use async_trait::async_trait;
use manga_db::models::task::{NewQueueTask, QueueTask};
use manga_db::repositories::TaskRepo;
use manga_db::DbPool;
use uuid::Uuid;

use crate::lane::Lane;

/// Errors from a [`TaskStore`].
#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Task store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt task row {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

/// A task claimed by one execution slot, leased until settled or expired.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub lane: Lane,
    pub payload: serde_json::Value,
    /// 1-based delivery count, including this claim.
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Durable task storage with lease-based claiming.
///
/// A claim moves a task to running and leases it; the holder must settle
/// it with [`ack`](Self::ack), [`retry`](Self::retry) or
/// [`bury`](Self::bury) before the lease lapses or it becomes claimable
/// again.
///
/// Every call on behalf of a claim carries its [`ClaimedTask::attempt`]. A
/// holder whose lease lapsed and whose task was claimed again no longer
/// matches, so it can neither renew nor settle the newer delivery.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn enqueue(
        &self,
        lane: Lane,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Result<Uuid, TaskStoreError>;

    /// Claim the oldest runnable task in `lane`, if any.
    async fn claim(&self, lane: Lane, lease: Duration) -> Result<Option<ClaimedTask>, TaskStoreError>;

    /// Returns `false` when the task is no longer held (lease lost).
    async fn extend_lease(&self, id: Uuid, attempt: u32, lease: Duration) -> Result<bool, TaskStoreError>;

    async fn ack(&self, id: Uuid, attempt: u32) -> Result<(), TaskStoreError>;

    async fn retry(
        &self,
        id: Uuid,
        attempt: u32,
        delay: Duration,
        error: &str,
    ) -> Result<(), TaskStoreError>;

    async fn bury(&self, id: Uuid, attempt: u32, error: &str) -> Result<(), TaskStoreError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// [`TaskStore`] over the `queue_tasks` table.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: DbPool,
}

impl PgTaskStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn attempt_column(attempt: u32) -> i32 {
    i32::try_from(attempt).unwrap_or(i32::MAX)
}

fn claimed_from_row(row: QueueTask) -> Result<ClaimedTask, TaskStoreError> {
    let lane = row
        .lane
        .parse::<Lane>()
        .map_err(|reason| TaskStoreError::Corrupt { id: row.id, reason })?;
    Ok(ClaimedTask {
        id: row.id,
        lane,
        payload: row.payload,
        attempt: u32::try_from(row.attempts).unwrap_or(0),
        max_attempts: u32::try_from(row.max_attempts).unwrap_or(1),
    })
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn enqueue(
        &self,
        lane: Lane,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Result<Uuid, TaskStoreError> {
        let input = NewQueueTask {
            lane: lane.as_str().to_string(),
            payload,
            max_attempts: i32::try_from(max_attempts.max(1)).unwrap_or(i32::MAX),
        };
        let row = TaskRepo::enqueue(&self.pool, &input).await?;
        Ok(row.id)
    }

    async fn claim(&self, lane: Lane, lease: Duration) -> Result<Option<ClaimedTask>, TaskStoreError> {
        TaskRepo::claim_next(&self.pool, lane.as_str(), lease)
            .await?
            .map(claimed_from_row)
            .transpose()
    }

    async fn extend_lease(&self, id: Uuid, attempt: u32, lease: Duration) -> Result<bool, TaskStoreError> {
        Ok(TaskRepo::extend_lease(&self.pool, id, attempt_column(attempt), lease).await?)
    }

    async fn ack(&self, id: Uuid, attempt: u32) -> Result<(), TaskStoreError> {
        if !TaskRepo::ack(&self.pool, id, attempt_column(attempt)).await? {
            tracing::warn!(task_id = %id, attempt, "Ack ignored, delivery no longer holds the task");
        }
        Ok(())
    }

    async fn retry(
        &self,
        id: Uuid,
        attempt: u32,
        delay: Duration,
        error: &str,
    ) -> Result<(), TaskStoreError> {
        if !TaskRepo::retry(&self.pool, id, attempt_column(attempt), delay, error).await? {
            tracing::warn!(task_id = %id, attempt, "Retry ignored, delivery no longer holds the task");
        }
        Ok(())
    }

    async fn bury(&self, id: Uuid, attempt: u32, error: &str) -> Result<(), TaskStoreError> {
        if !TaskRepo::bury(&self.pool, id, attempt_column(attempt), error).await? {
            tracing::warn!(task_id = %id, attempt, "Bury ignored, delivery no longer holds the task");
        }
        Ok(())
    }
}
