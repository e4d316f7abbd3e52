//! Translation request entity.

use manga_core::error::CoreError;
use manga_core::file_kind::FileKind;
use manga_core::types::{RequestId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::status::{RequestStatus, StatusId};

/// A row from the `requests` table.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: RequestId,
    pub filename: String,
    pub file_kind: String,
    pub status_id: StatusId,
    pub progress: i16,
    pub page_count: i32,
    pub thumbnail_path: Option<String>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl Request {
    /// Decoded lifecycle status.
    pub fn status(&self) -> Result<RequestStatus, CoreError> {
        RequestStatus::from_id(self.status_id).ok_or_else(|| {
            CoreError::Internal(format!("Unknown request status id {}", self.status_id))
        })
    }

    pub fn kind(&self) -> Result<FileKind, CoreError> {
        self.file_kind.parse()
    }

    /// `true` once the request reached `completed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        self.status().is_ok_and(RequestStatus::is_terminal)
    }
}

/// DTO for creating a queued request at intake.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub filename: String,
    pub file_kind: FileKind,
}

/// Query parameters for listing requests.
#[derive(Debug, Default, Deserialize)]
pub struct RequestListQuery {
    /// Filter by status ID.
    pub status_id: Option<StatusId>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}
