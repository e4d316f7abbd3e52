//! Error types for the pipeline.

use std::path::PathBuf;

use manga_core::types::RequestId;

/// Failures of the job state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Request {0} not found")]
    NotFound(RequestId),

    #[error("Job store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of one worker invocation that did not produce output.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The configured program or script does not exist.
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    /// The process could not be launched.
    #[error("Failed to start worker: {0}")]
    StartFailure(String),

    /// The worker exited non-zero.
    #[error("Worker exited with {}: {stderr}", exit_label(.exit_code))]
    RuntimeFailure {
        exit_code: Option<i32>,
        /// Last lines of standard error.
        stderr: String,
    },

    /// The job was cancelled or timed out and the worker was killed.
    #[error("Translation cancelled: {0}")]
    Cancelled(String),

    /// The worker exited zero but the expected artifact is absent.
    #[error("Worker output not found: {}", .0.display())]
    OutputMissing(PathBuf),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

/// Failures while turning worker output into page results.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to extract {}: {message}", .path.display())]
    Extract { path: PathBuf, message: String },

    #[error("Translated archive contains no images")]
    NoPages,

    #[error("Failed to save results: {0}")]
    Store(#[from] StoreError),
}

impl CatalogError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Why the translation handler could not finish a delivery.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

impl HandlerError {
    /// Only store failures are worth another attempt. Supervisor and
    /// catalog failures have already moved the request to `failed`, and a
    /// missing request will not appear on a later delivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if !matches!(e, StoreError::NotFound(_)))
    }
}

impl From<HandlerError> for manga_queue::TaskFailure {
    fn from(err: HandlerError) -> Self {
        if err.is_retryable() {
            Self::retryable(err.to_string())
        } else {
            Self::terminal(err.to_string())
        }
    }
}
