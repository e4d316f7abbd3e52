//! Request state machine as driven by one delivery of a task.
//!
//! [`JobLifecycle::begin`] moves a request to `processing` and opens its
//! progress topic. The returned [`JobRun`] routes parsed worker progress
//! into the store (best-effort) and the relay, and performs exactly one
//! terminal transition, whose store write is fatal when it fails.

use std::sync::Arc;

use manga_core::progress::ProgressLine;
use manga_core::types::RequestId;
use manga_db::models::status::RequestStatus;
use manga_events::{ProgressRelay, ProgressUpdate, Publisher};

use crate::error::StoreError;
use crate::store::JobStore;

/// Message published with a successful terminal update.
pub const COMPLETED_MESSAGE: &str = "Translation completed successfully";

#[derive(Clone)]
pub struct JobLifecycle {
    store: Arc<dyn JobStore>,
    relay: ProgressRelay,
}

impl JobLifecycle {
    pub fn new(store: Arc<dyn JobStore>, relay: ProgressRelay) -> Self {
        Self { store, relay }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn relay(&self) -> &ProgressRelay {
        &self.relay
    }

    /// Start (or resume) processing a request.
    ///
    /// Returns `None` when the request is already terminal, which makes a
    /// redelivered task a no-op.
    pub async fn begin(&self, request_id: RequestId) -> Result<Option<JobRun>, StoreError> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or(StoreError::NotFound(request_id))?;
        if request.is_terminal() {
            tracing::info!(request_id = %request_id, "Request already finished, skipping");
            return Ok(None);
        }

        if !self.store.mark_processing(request_id).await? {
            tracing::info!(request_id = %request_id, "Request left the queue concurrently, skipping");
            return Ok(None);
        }

        // A redelivery resumes from whatever progress was stored.
        let last_percent = match request.status() {
            Ok(RequestStatus::Processing) => u8::try_from(request.progress.clamp(0, 100)).unwrap_or(0),
            _ => 0,
        };

        tracing::info!(request_id = %request_id, "Request processing");
        Ok(Some(JobRun {
            request_id,
            store: Arc::clone(&self.store),
            publisher: self.relay.open(request_id),
            last_percent,
        }))
    }

    /// Mark a request failed without an open run.
    ///
    /// Used when a delivery gives up for good after a store failure; the
    /// write is best-effort because the store is the thing that failed.
    pub async fn abandon(&self, request_id: RequestId, message: &str) {
        match self.store.fail(request_id, message).await {
            Ok(true) => {
                self.relay.publish(ProgressUpdate::new(
                    request_id,
                    RequestStatus::Failed,
                    0,
                    format!("Translation failed: {message}"),
                ));
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "Failed to mark request failed");
            }
        }
    }
}

/// One delivery's view of a processing request.
pub struct JobRun {
    request_id: RequestId,
    store: Arc<dyn JobStore>,
    publisher: Publisher,
    last_percent: u8,
}

impl JobRun {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Highest percentage seen so far.
    pub fn last_percent(&self) -> u8 {
        self.last_percent
    }

    /// Record one parsed line of worker progress.
    ///
    /// Known percentages are written through a monotonic update whose
    /// failure is only logged. Every line is published, carrying the
    /// highest percentage seen.
    pub async fn report(&mut self, line: &ProgressLine) {
        if let Some(percent) = line.percent {
            if let Err(e) = self.store.advance_progress(self.request_id, percent).await {
                tracing::warn!(
                    request_id = %self.request_id,
                    percent,
                    error = %e,
                    "Failed to store progress",
                );
            }
            self.last_percent = self.last_percent.max(percent);
        }

        tracing::debug!(
            request_id = %self.request_id,
            percent = ?line.percent,
            message = %line.message,
            "Translation progress",
        );
        self.publisher.publish(ProgressUpdate::new(
            self.request_id,
            RequestStatus::Processing,
            self.last_percent,
            line.message.clone(),
        ));
    }

    /// `processing -> completed`. Must only be called once the results
    /// have been persisted.
    pub async fn complete(&self) -> Result<bool, StoreError> {
        let applied = self.store.complete(self.request_id).await?;
        if applied {
            tracing::info!(request_id = %self.request_id, "Translation completed");
            self.publisher.publish(ProgressUpdate::new(
                self.request_id,
                RequestStatus::Completed,
                100,
                COMPLETED_MESSAGE,
            ));
        } else {
            self.publish_stored_terminal().await;
        }
        Ok(applied)
    }

    /// Any non-terminal state `-> failed`, recording `message`.
    pub async fn fail(&self, message: &str) -> Result<bool, StoreError> {
        let applied = self.store.fail(self.request_id, message).await?;
        if applied {
            tracing::warn!(request_id = %self.request_id, error = %message, "Translation failed");
            self.publisher.publish(ProgressUpdate::new(
                self.request_id,
                RequestStatus::Failed,
                self.last_percent,
                format!("Translation failed: {message}"),
            ));
        } else {
            self.publish_stored_terminal().await;
        }
        Ok(applied)
    }

    /// Another delivery already finished the request; make sure the topic
    /// still ends with whatever the store says.
    async fn publish_stored_terminal(&self) {
        let request = match self.store.get_request(self.request_id).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(request_id = %self.request_id, error = %e, "Failed to reload request");
                return;
            }
        };
        let update = match request.status() {
            Ok(RequestStatus::Completed) => ProgressUpdate::new(
                self.request_id,
                RequestStatus::Completed,
                100,
                COMPLETED_MESSAGE,
            ),
            Ok(RequestStatus::Failed) => ProgressUpdate::new(
                self.request_id,
                RequestStatus::Failed,
                u8::try_from(request.progress.clamp(0, 100)).unwrap_or(0),
                format!(
                    "Translation failed: {}",
                    request.error_message.as_deref().unwrap_or("unknown error")
                ),
            ),
            _ => return,
        };
        tracing::info!(request_id = %self.request_id, status = %update.status, "Request already finished");
        self.publisher.publish(update);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use manga_core::file_kind::FileKind;
    use manga_db::models::request::CreateRequest;
    use tokio::time::Instant;

    use super::*;
    use crate::memory::{MemoryJobStore, StoreOp};

    async fn setup() -> (Arc<MemoryJobStore>, JobLifecycle, RequestId) {
        let store = Arc::new(MemoryJobStore::new());
        let lifecycle = JobLifecycle::new(store.clone(), ProgressRelay::default());
        let id = store
            .create_request(&CreateRequest {
                filename: "ch1.zip".into(),
                file_kind: FileKind::Archive,
            })
            .await
            .unwrap()
            .id;
        (store, lifecycle, id)
    }

    fn line(percent: Option<u8>, message: &str) -> ProgressLine {
        ProgressLine {
            percent,
            message: message.into(),
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn begin_marks_processing() {
        let (store, lifecycle, id) = setup().await;

        let run = lifecycle.begin(id).await.unwrap().unwrap();

        assert_eq!(run.last_percent(), 0);
        let request = store.get_request(id).await.unwrap().unwrap();
        assert_eq!(request.status().unwrap(), RequestStatus::Processing);
    }

    #[tokio::test]
    async fn begin_skips_terminal_request() {
        let (store, lifecycle, id) = setup().await;
        store.fail(id, "earlier").await.unwrap();

        assert!(lifecycle.begin(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn begin_unknown_request_is_not_found() {
        let (_store, lifecycle, _id) = setup().await;
        let missing = uuid::Uuid::new_v4();

        assert!(matches!(
            lifecycle.begin(missing).await,
            Err(StoreError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn redelivery_resumes_stored_progress() {
        let (store, lifecycle, id) = setup().await;
        let mut first = lifecycle.begin(id).await.unwrap().unwrap();
        first.report(&line(Some(40), "PROGRESS")).await;
        drop(first);

        let second = lifecycle.begin(id).await.unwrap().unwrap();
        assert_eq!(second.last_percent(), 40);
        assert_eq!(store.get_request(id).await.unwrap().unwrap().progress, 40);
    }

    #[tokio::test]
    async fn unknown_progress_is_relayed_but_not_stored() {
        let (store, lifecycle, id) = setup().await;
        let mut run = lifecycle.begin(id).await.unwrap().unwrap();
        let mut sub = lifecycle.relay().subscribe(id, deadline()).unwrap();

        run.report(&line(Some(0), "Initializing...")).await;
        run.report(&line(None, "Processing: p1.jpg")).await;
        run.report(&line(Some(100), "Translation completed: out.zip")).await;

        let first = sub.next().await.unwrap();
        let second = sub.next().await.unwrap();
        let third = sub.next().await.unwrap();
        assert_eq!((first.progress, first.message.as_str()), (0, "Initializing..."));
        assert_eq!((second.progress, second.message.as_str()), (0, "Processing: p1.jpg"));
        assert_eq!(third.progress, 100);
        assert_eq!(second.status, RequestStatus::Processing);
        assert_eq!(store.progress_log(id), vec![100]);
    }

    #[tokio::test]
    async fn regressing_progress_is_relayed_as_high_water_mark() {
        let (store, lifecycle, id) = setup().await;
        let mut run = lifecycle.begin(id).await.unwrap().unwrap();
        let mut sub = lifecycle.relay().subscribe(id, deadline()).unwrap();

        run.report(&line(Some(50), "half")).await;
        run.report(&line(Some(20), "late line")).await;

        assert_eq!(sub.next().await.unwrap().progress, 50);
        assert_eq!(sub.next().await.unwrap().progress, 50);
        assert_eq!(store.get_request(id).await.unwrap().unwrap().progress, 50);
    }

    #[tokio::test]
    async fn progress_store_failure_is_swallowed() {
        let (store, lifecycle, id) = setup().await;
        let mut run = lifecycle.begin(id).await.unwrap().unwrap();
        let mut sub = lifecycle.relay().subscribe(id, deadline()).unwrap();
        store.set_failing(StoreOp::AdvanceProgress, true);

        run.report(&line(Some(30), "PROGRESS")).await;

        assert_eq!(sub.next().await.unwrap().progress, 30);
        assert_eq!(store.get_request(id).await.unwrap().unwrap().progress, 0);
    }

    #[tokio::test]
    async fn complete_publishes_terminal_update() {
        let (store, lifecycle, id) = setup().await;
        let run = lifecycle.begin(id).await.unwrap().unwrap();
        let mut sub = lifecycle.relay().subscribe(id, deadline()).unwrap();

        assert!(run.complete().await.unwrap());

        let update = sub.next().await.unwrap();
        assert_eq!(update.status, RequestStatus::Completed);
        assert_eq!(update.progress, 100);
        assert_eq!(update.message, COMPLETED_MESSAGE);
        assert!(sub.next().await.is_none());
        assert_eq!(store.get_request(id).await.unwrap().unwrap().progress, 100);
    }

    #[tokio::test]
    async fn fail_records_message_once() {
        let (store, lifecycle, id) = setup().await;
        let run = lifecycle.begin(id).await.unwrap().unwrap();
        let mut sub = lifecycle.relay().subscribe(id, deadline()).unwrap();

        assert!(run.fail("Worker exited with code 1: boom").await.unwrap());
        assert!(!run.complete().await.unwrap());

        let update = sub.next().await.unwrap();
        assert_eq!(update.status, RequestStatus::Failed);
        assert_eq!(update.message, "Translation failed: Worker exited with code 1: boom");
        assert!(sub.next().await.is_none());

        let request = store.get_request(id).await.unwrap().unwrap();
        assert_eq!(request.error_message.as_deref(), Some("Worker exited with code 1: boom"));
    }

    #[tokio::test]
    async fn terminal_store_failure_is_fatal() {
        let (store, lifecycle, id) = setup().await;
        let run = lifecycle.begin(id).await.unwrap().unwrap();
        store.set_failing(StoreOp::Complete, true);

        assert!(matches!(run.complete().await, Err(StoreError::Unavailable(_))));
        let request = store.get_request(id).await.unwrap().unwrap();
        assert_eq!(request.status().unwrap(), RequestStatus::Processing);
    }

    #[tokio::test]
    async fn abandon_fails_request_outside_a_run() {
        let (store, lifecycle, id) = setup().await;
        store.mark_processing(id).await.unwrap();

        lifecycle.abandon(id, "State store error: down").await;
        lifecycle.abandon(id, "second").await;

        let request = store.get_request(id).await.unwrap().unwrap();
        assert_eq!(request.status().unwrap(), RequestStatus::Failed);
        assert_eq!(request.error_message.as_deref(), Some("State store error: down"));
    }
}
