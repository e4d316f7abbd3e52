//! Durable queue task rows.

use manga_core::types::Timestamp;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use super::status::StatusId;

/// A row from the `queue_tasks` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueueTask {
    pub id: Uuid,
    /// `critical` or `default`.
    pub lane: String,
    pub state_id: StatusId,
    pub payload: serde_json::Value,
    /// Number of times the task has been claimed, including the current claim.
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: Timestamp,
    pub locked_until: Option<Timestamp>,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for inserting a task.
#[derive(Debug, Clone)]
pub struct NewQueueTask {
    pub lane: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
}
