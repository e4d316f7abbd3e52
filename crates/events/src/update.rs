//! The message carried on a progress topic.

use manga_core::types::RequestId;
use manga_db::models::status::RequestStatus;
use serde::Serialize;

/// One progress notification for a request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub request_id: RequestId,
    pub status: RequestStatus,
    /// Last known percentage in `[0, 100]`.
    pub progress: u8,
    pub message: String,
}

impl ProgressUpdate {
    pub fn new(
        request_id: RequestId,
        status: RequestStatus,
        progress: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            status,
            progress: progress.min(100),
            message: message.into(),
        }
    }

    /// A `completed` or `failed` update ends every subscription on its topic.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
