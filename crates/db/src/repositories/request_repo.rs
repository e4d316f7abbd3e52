//! Repository for the `requests` table.
//!
//! Every lifecycle write is a single conditional `UPDATE`, so concurrent
//! writers for the same request serialise on the row lock and the
//! `WHERE` clause decides whether the transition still applies. Methods
//! return `true` when a row was changed.

use manga_core::types::RequestId;
use sqlx::PgPool;

use crate::models::request::{CreateRequest, Request, RequestListQuery};
use crate::models::status::{RequestStatus, StatusId};

/// Column list for `requests` queries.
const COLUMNS: &str = "\
    id, filename, file_kind, status_id, progress, page_count, \
    thumbnail_path, error_message, created_at, updated_at, completed_at";

/// Maximum page size for request listing.
const MAX_LIMIT: i64 = 100;

/// Default page size for request listing.
const DEFAULT_LIMIT: i64 = 50;

/// Provides CRUD and lifecycle transitions for translation requests.
pub struct RequestRepo;

impl RequestRepo {
    /// Insert a new request in `queued` state with zero progress.
    pub async fn create(pool: &PgPool, input: &CreateRequest) -> Result<Request, sqlx::Error> {
        let query = format!(
            "INSERT INTO requests (id, filename, file_kind, status_id, progress, page_count) \
             VALUES ($1, $2, $3, $4, 0, 0) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Request>(&query)
            .bind(uuid::Uuid::now_v7())
            .bind(&input.filename)
            .bind(input.file_kind.as_str())
            .bind(RequestStatus::Queued.id())
            .fetch_one(pool)
            .await
    }

    /// Find a request by its ID.
    pub async fn find_by_id(pool: &PgPool, id: RequestId) -> Result<Option<Request>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM requests WHERE id = $1");
        sqlx::query_as::<_, Request>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List requests, newest first, with optional status filter and pagination.
    pub async fn list(pool: &PgPool, params: &RequestListQuery) -> Result<Vec<Request>, sqlx::Error> {
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = params.offset.unwrap_or(0).max(0);

        let (where_clause, next_idx) = match params.status_id {
            Some(_) => ("WHERE status_id = $1", 2),
            None => ("", 1),
        };

        let query = format!(
            "SELECT {COLUMNS} FROM requests \
             {where_clause} \
             ORDER BY created_at DESC \
             LIMIT ${next_idx} OFFSET ${}",
            next_idx + 1,
        );

        let mut q = sqlx::query_as::<_, Request>(&query);
        if let Some(status_id) = params.status_id {
            q = q.bind(status_id);
        }
        q.bind(limit).bind(offset).fetch_all(pool).await
    }

    /// Count requests, optionally restricted to one status.
    pub async fn count(pool: &PgPool, status_id: Option<StatusId>) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM requests WHERE $1::SMALLINT IS NULL OR status_id = $1",
        )
        .bind(status_id)
        .fetch_one(pool)
        .await
    }

    /// `queued -> processing`, resetting progress to 0.
    ///
    /// Repeating the call on a request that is already processing keeps
    /// its progress (never moves it backward). Terminal requests are
    /// left untouched and `false` is returned.
    pub async fn mark_processing(pool: &PgPool, id: RequestId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE requests \
             SET status_id = $2, \
                 progress = CASE WHEN status_id = $3 THEN 0 ELSE progress END, \
                 updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($2, $3)",
        )
        .bind(id)
        .bind(RequestStatus::Processing.id())
        .bind(RequestStatus::Queued.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Raise progress to `percent` if it is higher than the stored value.
    ///
    /// Only applies while the request is processing. Returns `false` when
    /// the stored progress was already at or above `percent`.
    pub async fn advance_progress(
        pool: &PgPool,
        id: RequestId,
        percent: i16,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE requests \
             SET progress = $2, updated_at = NOW() \
             WHERE id = $1 AND status_id = $3 AND progress < $2",
        )
        .bind(id)
        .bind(percent.clamp(0, 100))
        .bind(RequestStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the page count after the result batch committed.
    pub async fn set_page_count(
        pool: &PgPool,
        id: RequestId,
        page_count: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE requests SET page_count = $2, updated_at = NOW() \
             WHERE id = $1 AND status_id = $3",
        )
        .bind(id)
        .bind(page_count)
        .bind(RequestStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `processing -> completed`, forcing progress to 100.
    ///
    /// Sets `completed_at`; a second call is a no-op returning `false`.
    pub async fn complete(pool: &PgPool, id: RequestId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE requests \
             SET status_id = $2, progress = 100, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $3",
        )
        .bind(id)
        .bind(RequestStatus::Completed.id())
        .bind(RequestStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Any non-terminal state `-> failed` with an error message.
    ///
    /// Sets `completed_at`; a request that is already terminal is left
    /// untouched and `false` is returned.
    pub async fn fail(pool: &PgPool, id: RequestId, error: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE requests \
             SET status_id = $2, error_message = $3, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($4, $5)",
        )
        .bind(id)
        .bind(RequestStatus::Failed.id())
        .bind(error)
        .bind(RequestStatus::Queued.id())
        .bind(RequestStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
