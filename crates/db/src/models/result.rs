//! Per-page translation results.

use manga_core::types::{RequestId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A row from the `results` table: one page's before/after pair.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    pub id: Uuid,
    pub request_id: RequestId,
    /// 1-based, unique within a request.
    pub page_number: i32,
    /// Empty when the translated page has no original counterpart.
    pub original_path: String,
    pub translated_path: String,
    pub created_at: Timestamp,
}

/// One page of a result batch, before it is assigned an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPageResult {
    pub page_number: i32,
    pub original_path: String,
    pub translated_path: String,
}
