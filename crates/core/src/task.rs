//! Durable queue payload for a translation job.

use serde::{Deserialize, Serialize};

use crate::file_kind::FileKind;
use crate::types::RequestId;

/// Everything an execution slot needs to run one request.
///
/// Serialized as JSON into the queue's `payload` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub request_id: RequestId,
    /// Input path as seen by the intake process (may need rewriting).
    pub file_path: String,
    pub file_kind: FileKind,
}

impl TaskDescriptor {
    pub fn new(request_id: RequestId, file_path: impl Into<String>, file_kind: FileKind) -> Self {
        Self {
            request_id,
            file_path: file_path.into(),
            file_kind,
        }
    }
}
