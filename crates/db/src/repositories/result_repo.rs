//! Repository for the `results` table.

use manga_core::types::RequestId;
use sqlx::PgPool;

use crate::models::result::{NewPageResult, PageResult};

/// Column list for `results` queries.
const COLUMNS: &str =
    "id, request_id, page_number, original_path, translated_path, created_at";

/// Provides batch writes and lookups for page results.
pub struct ResultRepo;

impl ResultRepo {
    /// Replace the result set of a request with `pages`, atomically.
    ///
    /// Runs in one transaction: readers see either the previous set (none,
    /// on first delivery) or the complete new one. A redelivered task
    /// therefore overwrites rather than duplicates.
    pub async fn create_batch(
        pool: &PgPool,
        request_id: RequestId,
        pages: &[NewPageResult],
    ) -> Result<Vec<PageResult>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let mut rows = Vec::with_capacity(pages.len());

        sqlx::query("DELETE FROM results WHERE request_id = $1")
            .bind(request_id)
            .execute(&mut *tx)
            .await?;

        let query = format!(
            "INSERT INTO results (id, request_id, page_number, original_path, translated_path) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );

        for page in pages {
            let row = sqlx::query_as::<_, PageResult>(&query)
                .bind(uuid::Uuid::now_v7())
                .bind(request_id)
                .bind(page.page_number)
                .bind(&page.original_path)
                .bind(&page.translated_path)
                .fetch_one(&mut *tx)
                .await?;
            rows.push(row);
        }

        tx.commit().await?;
        Ok(rows)
    }

    /// All results for a request, ordered by page number.
    pub async fn list_by_request(
        pool: &PgPool,
        request_id: RequestId,
    ) -> Result<Vec<PageResult>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM results WHERE request_id = $1 ORDER BY page_number ASC"
        );
        sqlx::query_as::<_, PageResult>(&query)
            .bind(request_id)
            .fetch_all(pool)
            .await
    }

    /// Number of results stored for a request.
    pub async fn count_by_request(pool: &PgPool, request_id: RequestId) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM results WHERE request_id = $1")
            .bind(request_id)
            .fetch_one(pool)
            .await
    }
}
