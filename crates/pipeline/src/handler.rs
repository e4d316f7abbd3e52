//! The queue handler that runs one translation job end to end.

use std::sync::Arc;

use async_trait::async_trait;
use manga_core::task::TaskDescriptor;
use manga_queue::{TaskContext, TaskFailure, TaskHandler};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog::OutputCataloger;
use crate::error::{HandlerError, SupervisorError};
use crate::lifecycle::{JobLifecycle, JobRun};
use crate::supervisor::{JobContext, WorkerOutput, WorkerSupervisor};

/// Supervises the worker, catalogs its output and settles the request.
pub struct TranslationHandler {
    lifecycle: JobLifecycle,
    supervisor: WorkerSupervisor,
    cataloger: Arc<OutputCataloger>,
}

impl TranslationHandler {
    pub fn new(
        lifecycle: JobLifecycle,
        supervisor: WorkerSupervisor,
        cataloger: Arc<OutputCataloger>,
    ) -> Self {
        Self {
            lifecycle,
            supervisor,
            cataloger,
        }
    }

    /// Run one delivery of `task`.
    ///
    /// Worker and catalog failures move the request to `failed` before
    /// they are returned. Store failures leave it for the next delivery.
    pub async fn process(
        &self,
        task: &TaskDescriptor,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        let request_id = task.request_id;
        tracing::info!(
            request_id = %request_id,
            file_path = %task.file_path,
            file_kind = %task.file_kind,
            "Processing translation task",
        );

        let Some(mut run) = self.lifecycle.begin(request_id).await? else {
            return Ok(());
        };

        let ctx = JobContext {
            request_id,
            file_kind: task.file_kind,
            cancel,
        };
        let output = match self.execute(&ctx, &task.file_path, &mut run).await {
            Ok(output) => output,
            Err(e) => {
                run.fail(&e.to_string()).await?;
                return Err(e.into());
            }
        };

        if let Err(e) = self.cataloger.catalog(request_id, task.file_kind, &output).await {
            tracing::error!(request_id = %request_id, error = %e, "Failed to process output files");
            run.fail(&e.to_string()).await?;
            return Err(e.into());
        }

        run.complete().await?;
        Ok(())
    }

    /// Run the worker while forwarding its progress to `run`.
    async fn execute(
        &self,
        ctx: &JobContext,
        input_path: &str,
        run: &mut JobRun,
    ) -> Result<WorkerOutput, SupervisorError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let execution = self.supervisor.execute(ctx, input_path, tx);
        tokio::pin!(execution);

        let outcome = loop {
            tokio::select! {
                result = &mut execution => break result,
                Some(line) = rx.recv() => run.report(&line).await,
            }
        };

        // Lines still buffered were emitted before the process exited, so
        // they precede the terminal update. A killed worker's are dropped.
        if !matches!(outcome, Err(SupervisorError::Cancelled(_))) {
            while let Some(line) = rx.recv().await {
                run.report(&line).await;
            }
        }
        outcome
    }
}

#[async_trait]
impl TaskHandler for TranslationHandler {
    async fn handle(&self, task: TaskContext) -> Result<(), TaskFailure> {
        let descriptor: TaskDescriptor = task.decode()?;
        let request_id = descriptor.request_id;

        match self.process(&descriptor, task.cancel.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_retryable() && task.is_final_attempt() {
                    self.lifecycle.abandon(request_id, &e.to_string()).await;
                }
                tracing::warn!(
                    request_id = %request_id,
                    attempt = task.attempt,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Translation task failed",
                );
                Err(e.into())
            }
        }
    }

    async fn abandoned(&self, task: &TaskContext, reason: &str) {
        match task.decode::<TaskDescriptor>() {
            Ok(descriptor) => {
                tracing::error!(
                    request_id = %descriptor.request_id,
                    attempt = task.attempt,
                    reason,
                    "Translation task abandoned",
                );
                self.lifecycle.abandon(descriptor.request_id, reason).await;
            }
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, error = %e, "Abandoned task has no request");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use manga_core::file_kind::FileKind;
    use manga_core::paths::{identity_mapper, StorageArea, StorageLayout};
    use manga_core::types::RequestId;
    use manga_db::models::request::CreateRequest;
    use manga_db::models::status::RequestStatus;
    use manga_events::ProgressRelay;
    use manga_queue::{Dispatcher, DispatcherConfig, Lane, MemoryTaskStore, TaskStore};
    use tempfile::TempDir;
    use tokio::time::Instant;

    use super::*;
    use crate::error::StoreError;
    use crate::memory::{MemoryJobStore, StoreOp};
    use crate::store::JobStore;
    use crate::supervisor::SupervisorConfig;

    struct Fixture {
        _dir: TempDir,
        layout: StorageLayout,
        store: Arc<MemoryJobStore>,
        relay: ProgressRelay,
        handler: TranslationHandler,
    }

    impl Fixture {
        fn new(script: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let layout = StorageLayout::new(dir.path().join("storage"));
            let worker_dir = dir.path().join("worker");
            std::fs::create_dir_all(&worker_dir).unwrap();
            let script_path = dir.path().join("worker.sh");
            std::fs::write(&script_path, script).unwrap();

            let store = Arc::new(MemoryJobStore::new());
            let relay = ProgressRelay::default();
            let supervisor = WorkerSupervisor::new(SupervisorConfig {
                program: "sh".into(),
                script: Some(script_path),
                working_dir: worker_dir,
                scratch_root: layout.scratch_root(),
                timeout: Some(Duration::from_secs(10)),
                path_mapper: identity_mapper(),
            });
            let cataloger = Arc::new(OutputCataloger::new(layout.clone(), store.clone()));
            let handler = TranslationHandler::new(
                JobLifecycle::new(store.clone(), relay.clone()),
                supervisor,
                cataloger,
            );
            Self {
                _dir: dir,
                layout,
                store,
                relay,
                handler,
            }
        }

        /// A queued image request with its upload on disk.
        async fn image_request(&self) -> (RequestId, TaskDescriptor) {
            let request = self
                .store
                .create_request(&CreateRequest {
                    filename: "page.png".into(),
                    file_kind: FileKind::Image,
                })
                .await
                .unwrap();
            let uploads = self.layout.request_dir(StorageArea::Uploads, request.id);
            std::fs::create_dir_all(&uploads).unwrap();
            let input = uploads.join("page.png");
            std::fs::write(&input, b"png").unwrap();
            (
                request.id,
                TaskDescriptor::new(request.id, path_str(&input), FileKind::Image),
            )
        }

        async fn status(&self, id: RequestId) -> RequestStatus {
            self.store
                .get_request(id)
                .await
                .unwrap()
                .unwrap()
                .status()
                .unwrap()
        }
    }

    fn path_str(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    fn task_context(task: &TaskDescriptor, attempt: u32) -> TaskContext {
        TaskContext {
            task_id: uuid::Uuid::new_v4(),
            lane: Lane::Default,
            attempt,
            max_attempts: 3,
            payload: serde_json::to_value(task).unwrap(),
            cancel: CancellationToken::new(),
        }
    }

    const SUCCESS_SCRIPT: &str = "echo '⚙️ Device: CUDA'\n\
        echo 'Processing: p1.jpg'\n\
        echo 'PROGRESS: 60% - Translated 1/1 pages'\n\
        touch translated_page.jpg\n\
        echo '✅ Created: translated_page.jpg'\n";

    #[tokio::test]
    async fn successful_job_completes_with_results() {
        let fx = Fixture::new(SUCCESS_SCRIPT);
        let (id, task) = fx.image_request().await;
        let mut sub = fx
            .relay
            .subscribe(id, Instant::now() + Duration::from_secs(10))
            .unwrap();

        fx.handler.handle(task_context(&task, 1)).await.unwrap();

        let mut events = Vec::new();
        while let Some(update) = sub.next().await {
            events.push((update.status, update.progress, update.message));
        }
        assert_eq!(
            events,
            vec![
                (RequestStatus::Processing, 0, "Initializing...".to_string()),
                (RequestStatus::Processing, 0, "Processing: p1.jpg".to_string()),
                (RequestStatus::Processing, 60, "Translated 1/1 pages".to_string()),
                (
                    RequestStatus::Processing,
                    100,
                    "Translation completed: translated_page.jpg".to_string()
                ),
                (
                    RequestStatus::Completed,
                    100,
                    "Translation completed successfully".to_string()
                ),
            ]
        );

        let request = fx.store.get_request(id).await.unwrap().unwrap();
        assert_eq!(request.status().unwrap(), RequestStatus::Completed);
        assert_eq!(request.page_count, 1);
        let results = fx.store.list_results(id).await.unwrap();
        assert_eq!(results[0].translated_path, format!("/api/files/{id}/translated/translated_page.jpg"));
        assert_eq!(fx.store.progress_log(id), vec![60, 100]);
    }

    #[tokio::test]
    async fn worker_failure_fails_request_terminally() {
        let fx = Fixture::new("echo 'Traceback: boom' >&2\nexit 1\n");
        let (id, task) = fx.image_request().await;

        let failure = fx.handler.handle(task_context(&task, 1)).await.unwrap_err();

        assert!(!failure.is_retryable());
        assert_eq!(fx.status(id).await, RequestStatus::Failed);
        let request = fx.store.get_request(id).await.unwrap().unwrap();
        assert_eq!(
            request.error_message.as_deref(),
            Some("Worker exited with code 1: Traceback: boom")
        );
    }

    #[tokio::test]
    async fn cancelled_job_fails_with_distinct_message() {
        let fx = Fixture::new("echo 'PROGRESS: 10% - started'\nexec sleep 30\n");
        let (id, task) = fx.image_request().await;
        let ctx = task_context(&task, 1);
        let cancel = ctx.cancel.clone();
        let mut sub = fx
            .relay
            .subscribe(id, Instant::now() + Duration::from_secs(10))
            .unwrap();

        let handle = fx.handler.handle(ctx);
        tokio::pin!(handle);
        tokio::select! {
            _ = &mut handle => panic!("worker should still be running"),
            update = sub.next() => assert_eq!(update.unwrap().progress, 10),
        }
        cancel.cancel();
        let failure = handle.await.unwrap_err();

        assert!(!failure.is_retryable());
        let request = fx.store.get_request(id).await.unwrap().unwrap();
        assert_eq!(request.status().unwrap(), RequestStatus::Failed);
        let message = request.error_message.unwrap();
        assert!(message.starts_with("Translation cancelled"), "{message}");

        let last = sub.next().await.unwrap();
        assert_eq!(last.status, RequestStatus::Failed);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn missing_output_fails_request() {
        let fx = Fixture::new("echo 'nothing written'\n");
        let (id, task) = fx.image_request().await;

        let failure = fx.handler.handle(task_context(&task, 1)).await.unwrap_err();

        assert!(failure.message().starts_with("Worker output not found"));
        assert_eq!(fx.status(id).await, RequestStatus::Failed);
    }

    #[tokio::test]
    async fn catalog_failure_fails_request_despite_worker_success() {
        let fx = Fixture::new(SUCCESS_SCRIPT);
        let (id, task) = fx.image_request().await;
        fx.store.set_failing(StoreOp::SaveResults, true);

        let failure = fx.handler.handle(task_context(&task, 1)).await.unwrap_err();

        assert!(!failure.is_retryable());
        assert_eq!(fx.status(id).await, RequestStatus::Failed);
        assert!(fx.store.list_results(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn page_count_failure_fails_request_without_results() {
        let fx = Fixture::new(SUCCESS_SCRIPT);
        let (id, task) = fx.image_request().await;
        fx.store.set_failing(StoreOp::SetPageCount, true);

        let failure = fx.handler.handle(task_context(&task, 1)).await.unwrap_err();

        assert!(!failure.is_retryable());
        assert_eq!(fx.status(id).await, RequestStatus::Failed);
        assert!(fx.store.list_results(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_write_failure_is_retryable() {
        let fx = Fixture::new(SUCCESS_SCRIPT);
        let (id, task) = fx.image_request().await;
        fx.store.set_failing(StoreOp::Complete, true);

        let failure = fx.handler.handle(task_context(&task, 1)).await.unwrap_err();

        assert!(failure.is_retryable());
        assert_eq!(fx.status(id).await, RequestStatus::Processing);

        fx.store.set_failing(StoreOp::Complete, false);
        fx.handler.handle(task_context(&task, 2)).await.unwrap();
        assert_eq!(fx.status(id).await, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn final_attempt_store_failure_abandons_request() {
        let fx = Fixture::new(SUCCESS_SCRIPT);
        let (id, task) = fx.image_request().await;
        fx.store.set_failing(StoreOp::Complete, true);

        let failure = fx.handler.handle(task_context(&task, 3)).await.unwrap_err();

        assert!(failure.is_retryable());
        assert_eq!(fx.status(id).await, RequestStatus::Failed);
    }

    #[tokio::test]
    async fn abandoned_task_fails_its_request() {
        let fx = Fixture::new(SUCCESS_SCRIPT);
        let (id, task) = fx.image_request().await;
        fx.store.mark_processing(id).await.unwrap();
        let mut sub = fx
            .relay
            .subscribe(id, Instant::now() + Duration::from_secs(10))
            .unwrap();

        fx.handler
            .abandoned(&task_context(&task, 3), "Task handler panicked")
            .await;

        let request = fx.store.get_request(id).await.unwrap().unwrap();
        assert_eq!(request.status().unwrap(), RequestStatus::Failed);
        assert_eq!(request.error_message.as_deref(), Some("Task handler panicked"));
        let update = sub.next().await.unwrap();
        assert_eq!(update.status, RequestStatus::Failed);
        assert_eq!(update.message, "Translation failed: Task handler panicked");
    }

    #[tokio::test]
    async fn abandoned_finished_request_keeps_its_outcome() {
        let fx = Fixture::new(SUCCESS_SCRIPT);
        let (id, task) = fx.image_request().await;
        fx.handler.handle(task_context(&task, 1)).await.unwrap();

        fx.handler
            .abandoned(&task_context(&task, 3), "Retry budget exhausted")
            .await;

        assert_eq!(fx.status(id).await, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn exhausted_redelivery_fails_request_through_dispatcher() {
        let fx = Fixture::new(SUCCESS_SCRIPT);
        let (id, task) = fx.image_request().await;
        let tasks = Arc::new(MemoryTaskStore::new());
        let task_id = tasks
            .enqueue(Lane::Default, serde_json::to_value(&task).unwrap(), 1)
            .await
            .unwrap();
        // A previous holder claimed the task, started the job and crashed.
        tasks.claim(Lane::Default, Duration::from_secs(30)).await.unwrap().unwrap();
        fx.store.mark_processing(id).await.unwrap();
        tasks.expire_lease(task_id);

        let Fixture { store, handler, .. } = fx;
        let dispatcher = Dispatcher::new(
            tasks.clone(),
            Arc::new(handler),
            DispatcherConfig {
                poll_interval: Duration::from_millis(5),
                ..DispatcherConfig::default()
            },
        );
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let watcher = tasks.clone();
        tokio::spawn(async move {
            while watcher.find(task_id).map(|t| t.state)
                != Some(manga_queue::memory::MemoryTaskState::Dead)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });
        tokio::time::timeout(Duration::from_secs(10), dispatcher.run(shutdown))
            .await
            .expect("dispatcher should drain");

        let request = store.get_request(id).await.unwrap().unwrap();
        assert_eq!(request.status().unwrap(), RequestStatus::Failed);
        assert_eq!(request.error_message.as_deref(), Some("Retry budget exhausted"));
    }

    #[tokio::test]
    async fn redelivered_finished_task_is_noop() {
        let fx = Fixture::new(SUCCESS_SCRIPT);
        let (id, task) = fx.image_request().await;
        fx.handler.handle(task_context(&task, 1)).await.unwrap();
        let first = fx.store.get_request(id).await.unwrap().unwrap();

        fx.handler.handle(task_context(&task, 2)).await.unwrap();

        let second = fx.store.get_request(id).await.unwrap().unwrap();
        assert_eq!(second.completed_at, first.completed_at);
    }

    #[tokio::test]
    async fn malformed_payload_is_terminal() {
        let fx = Fixture::new(SUCCESS_SCRIPT);
        let mut ctx = task_context(
            &TaskDescriptor::new(uuid::Uuid::new_v4(), "x", FileKind::Image),
            1,
        );
        ctx.payload = serde_json::json!({ "filePath": 42 });

        let failure = fx.handler.handle(ctx).await.unwrap_err();

        assert!(!failure.is_retryable());
        assert!(failure.message().starts_with("Invalid task payload"));
    }

    #[tokio::test]
    async fn unknown_request_is_not_retried() {
        let fx = Fixture::new(SUCCESS_SCRIPT);
        let task = TaskDescriptor::new(uuid::Uuid::new_v4(), "/nowhere/x.png", FileKind::Image);

        let err = fx
            .handler
            .process(&task, CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, HandlerError::Store(StoreError::NotFound(_)));
        assert!(!err.is_retryable());
    }
}
