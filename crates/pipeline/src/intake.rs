//! Submission side: create the queued request and enqueue its task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use manga_core::file_kind::FileKind;
use manga_core::paths::{StorageArea, StorageLayout};
use manga_core::task::TaskDescriptor;
use manga_db::models::request::{CreateRequest, Request};
use manga_queue::{EnqueueError, Lane, TaskHandle, TaskQueue};

use crate::error::StoreError;
use crate::store::JobStore;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Unsupported file type: {0}")]
    UnsupportedFile(String),

    #[error("Failed to store upload: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to enqueue task: {0}")]
    Enqueue(#[from] EnqueueError),
}

pub struct Intake {
    store: Arc<dyn JobStore>,
    queue: TaskQueue,
    layout: StorageLayout,
}

impl Intake {
    pub fn new(store: Arc<dyn JobStore>, queue: TaskQueue, layout: StorageLayout) -> Self {
        Self {
            store,
            queue,
            layout,
        }
    }

    /// Create, store and enqueue an upload in one go.
    pub async fn submit(&self, filename: &str, contents: &[u8]) -> Result<Request, IntakeError> {
        let request = self.register(filename).await?;
        let path = self.upload_path(&request);
        if let Err(e) = store_upload(&path, contents).await {
            self.fail(&request, &format!("Failed to store upload: {e}")).await;
            return Err(e.into());
        }
        self.dispatch(&request, &path.to_string_lossy()).await?;
        Ok(request)
    }

    /// Classify `filename` and create its queued request.
    pub async fn register(&self, filename: &str) -> Result<Request, IntakeError> {
        let file_kind = FileKind::classify(filename)
            .ok_or_else(|| IntakeError::UnsupportedFile(filename.to_string()))?;
        let request = self
            .store
            .create_request(&CreateRequest {
                filename: filename.to_string(),
                file_kind,
            })
            .await?;
        tracing::info!(
            request_id = %request.id,
            filename = %filename,
            file_kind = %file_kind,
            "Translation request created",
        );
        Ok(request)
    }

    /// Where the upload for `request` belongs:
    /// `{root}/uploads/{requestId}/{filename}`.
    pub fn upload_path(&self, request: &Request) -> PathBuf {
        let name = Path::new(&request.filename)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| request.filename.clone().into());
        self.layout
            .request_dir(StorageArea::Uploads, request.id)
            .join(name)
    }

    /// Enqueue the task for a registered request whose upload is stored
    /// at `file_path`.
    ///
    /// When the queue refuses the task the request is marked failed so it
    /// never lingers as `queued`.
    pub async fn dispatch(&self, request: &Request, file_path: &str) -> Result<TaskHandle, IntakeError> {
        let file_kind = request.kind().map_err(|_| IntakeError::UnsupportedFile(request.filename.clone()))?;
        let task = TaskDescriptor::new(request.id, file_path, file_kind);
        match self.queue.enqueue(Lane::Default, &task).await {
            Ok(handle) => {
                tracing::info!(request_id = %request.id, task_id = %handle.id, "Translation task enqueued");
                Ok(handle)
            }
            Err(e) => {
                self.fail(request, &format!("Failed to enqueue task: {e}")).await;
                Err(e.into())
            }
        }
    }

    async fn fail(&self, request: &Request, message: &str) {
        tracing::error!(request_id = %request.id, error = %message, "Submission failed");
        if let Err(e) = self.store.fail(request.id, message).await {
            tracing::error!(request_id = %request.id, error = %e, "Failed to mark request failed");
        }
    }
}

async fn store_upload(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await
}
