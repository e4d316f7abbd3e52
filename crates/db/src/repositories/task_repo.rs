//! Repository for the `queue_tasks` table.
//!
//! Claims use `SELECT FOR UPDATE SKIP LOCKED` so several dispatchers can
//! share one table without double-dispatch. A claim holds a lease
//! (`locked_until`); a running task whose lease lapsed is claimable again,
//! which gives at-least-once delivery across process crashes.
//!
//! Every call made on behalf of a claim passes the claim's `attempts`
//! value; once a lapsed task is claimed again, the older holder can no
//! longer renew or settle it.

use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::status::TaskState;
use crate::models::task::{NewQueueTask, QueueTask};

/// Column list for `queue_tasks` queries.
const COLUMNS: &str = "\
    id, lane, state_id, payload, attempts, max_attempts, \
    run_at, locked_until, last_error, created_at, updated_at";

/// Provides enqueue/claim/settle operations for the durable task queue.
pub struct TaskRepo;

impl TaskRepo {
    /// Insert a pending task, runnable immediately.
    pub async fn enqueue(pool: &PgPool, input: &NewQueueTask) -> Result<QueueTask, sqlx::Error> {
        let query = format!(
            "INSERT INTO queue_tasks (id, lane, state_id, payload, max_attempts) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QueueTask>(&query)
            .bind(Uuid::now_v7())
            .bind(&input.lane)
            .bind(TaskState::Pending.id())
            .bind(&input.payload)
            .bind(input.max_attempts)
            .fetch_one(pool)
            .await
    }

    /// Atomically claim the oldest runnable task in `lane`.
    ///
    /// Runnable means pending with `run_at` in the past, or running with
    /// an expired lease. The claim bumps `attempts` and sets a fresh lease.
    pub async fn claim_next(
        pool: &PgPool,
        lane: &str,
        lease: Duration,
    ) -> Result<Option<QueueTask>, sqlx::Error> {
        let query = format!(
            "UPDATE queue_tasks \
             SET state_id = $3, attempts = attempts + 1, \
                 locked_until = NOW() + make_interval(secs => $2), updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM queue_tasks \
                 WHERE lane = $1 \
                   AND ((state_id = $4 AND run_at <= NOW()) \
                        OR (state_id = $3 AND locked_until < NOW())) \
                 ORDER BY run_at ASC, created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QueueTask>(&query)
            .bind(lane)
            .bind(lease.as_secs_f64())
            .bind(TaskState::Running.id())
            .bind(TaskState::Pending.id())
            .fetch_optional(pool)
            .await
    }

    /// Push the lease of a running task forward.
    pub async fn extend_lease(
        pool: &PgPool,
        id: Uuid,
        attempt: i32,
        lease: Duration,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queue_tasks \
             SET locked_until = NOW() + make_interval(secs => $2), updated_at = NOW() \
             WHERE id = $1 AND state_id = $3 AND attempts = $4",
        )
        .bind(id)
        .bind(lease.as_secs_f64())
        .bind(TaskState::Running.id())
        .bind(attempt)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a running task as successfully handled.
    pub async fn ack(pool: &PgPool, id: Uuid, attempt: i32) -> Result<bool, sqlx::Error> {
        Self::settle(pool, id, attempt, TaskState::Done, None).await
    }

    /// Return a running task to the pending state, runnable after `delay`.
    pub async fn retry(
        pool: &PgPool,
        id: Uuid,
        attempt: i32,
        delay: Duration,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queue_tasks \
             SET state_id = $2, run_at = NOW() + make_interval(secs => $3), \
                 locked_until = NULL, last_error = $4, updated_at = NOW() \
             WHERE id = $1 AND state_id = $5 AND attempts = $6",
        )
        .bind(id)
        .bind(TaskState::Pending.id())
        .bind(delay.as_secs_f64())
        .bind(error)
        .bind(TaskState::Running.id())
        .bind(attempt)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Give up on a task permanently.
    pub async fn bury(
        pool: &PgPool,
        id: Uuid,
        attempt: i32,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        Self::settle(pool, id, attempt, TaskState::Dead, Some(error)).await
    }

    /// Find a task by its ID.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<QueueTask>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM queue_tasks WHERE id = $1");
        sqlx::query_as::<_, QueueTask>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Number of tasks currently in `state`.
    pub async fn count_by_state(pool: &PgPool, state: TaskState) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queue_tasks WHERE state_id = $1")
            .bind(state.id())
            .fetch_one(pool)
            .await
    }

    async fn settle(
        pool: &PgPool,
        id: Uuid,
        attempt: i32,
        state: TaskState,
        error: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queue_tasks \
             SET state_id = $2, locked_until = NULL, \
                 last_error = COALESCE($3, last_error), updated_at = NOW() \
             WHERE id = $1 AND state_id = $4 AND attempts = $5",
        )
        .bind(id)
        .bind(state.id())
        .bind(error)
        .bind(TaskState::Running.id())
        .bind(attempt)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
